//! Basic 认证校验与失败延迟。

use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::{body::Body as AxumBody, middleware, response::Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{AUTH_FAILURE_DELAY_SECS, AUTH_REALM};
use crate::error::ApiError;
use crate::http::client_addr;

/// 单一静态账号的认证配置。
#[derive(Debug)]
pub struct AuthConfig {
    expected_header: String,
    pub failure_delay: Duration,
}

impl AuthConfig {
    pub fn new(username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        Self {
            expected_header: format!("Basic {encoded}"),
            failure_delay: Duration::from_secs(AUTH_FAILURE_DELAY_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    /// `Authorization` 头必须与预期值逐字相等。
    pub fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == self.expected_header)
    }
}

/// 尽力解码请求携带的凭据，仅用于日志；任何解码失败都返回空串。
pub fn decode_attempt(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_whitespace().nth(1))
        .and_then(|token| STANDARD.decode(token).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// 认证中间件：失败时记录、延迟并返回 401 质询。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if auth.is_authenticated(req.headers()) {
        return Ok(next.run(req).await);
    }

    let client_ip = client_addr(req.headers(), req.extensions());
    warn!(
        attempt = %decode_attempt(req.headers()),
        client_ip = %client_ip,
        path = req.uri().path(),
        "auth failure"
    );
    tokio::time::sleep(auth.failure_delay).await;

    let mut headers = HeaderMap::new();
    let challenge = HeaderValue::from_str(&format!(r#"Basic realm="{AUTH_REALM}""#))
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))?;
    headers.insert(header::WWW_AUTHENTICATE, challenge);
    Err(ApiError::Unauthorized(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(value).expect("header value"),
        );
        headers
    }

    #[test]
    fn accepts_exact_credentials() {
        let auth = AuthConfig::new("admin", "hunter2");
        let encoded = STANDARD.encode("admin:hunter2");
        assert!(auth.is_authenticated(&basic(&format!("Basic {encoded}"))));
    }

    #[test]
    fn rejects_wrong_or_missing_credentials() {
        let auth = AuthConfig::new("admin", "hunter2");
        let wrong = STANDARD.encode("admin:hunter3");
        assert!(!auth.is_authenticated(&basic(&format!("Basic {wrong}"))));
        assert!(!auth.is_authenticated(&HeaderMap::new()));

        let right = STANDARD.encode("admin:hunter2");
        assert!(!auth.is_authenticated(&basic(&format!("Bearer {right}"))));
        assert!(!auth.is_authenticated(&basic(&format!("Basic  {right}"))));
    }

    #[test]
    fn decode_attempt_is_best_effort() {
        let encoded = STANDARD.encode("mallory:guess");
        assert_eq!(decode_attempt(&basic(&format!("Basic {encoded}"))), "mallory:guess");
        assert_eq!(decode_attempt(&basic("Basic !!!not-base64")), "");
        assert_eq!(decode_attempt(&basic("Basic")), "");
        assert_eq!(decode_attempt(&HeaderMap::new()), "");
    }
}
