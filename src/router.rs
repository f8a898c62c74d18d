//! 路由装配：认证、GET/HEAD 文件服务与 POST 上传。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{AuthConfig, auth_middleware};
use crate::files::serve_path;
use crate::http::extract_forwarded_ip;
use crate::storage::Storage;
use crate::upload::upload_file;

/// 构建应用路由。GET 路由同时处理 HEAD。
pub fn build_router(storage: Arc<Storage>, auth: Arc<AuthConfig>) -> Router {
    Router::new()
        .route("/", get(serve_path).post(upload_file))
        .route("/{*path}", get(serve_path).post(upload_file))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(auth_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip =
                        extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(auth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const USER: &str = "admin";
    const PASS: &str = "hunter2";

    async fn make_app() -> (tempfile::TempDir, Arc<Storage>, Router) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("public");
        std::fs::create_dir_all(&root).expect("create root");
        let storage = Arc::new(Storage::open(root).await.expect("open storage"));
        let auth = Arc::new(AuthConfig::new(USER, PASS).with_failure_delay(Duration::ZERO));
        let app = build_router(storage.clone(), auth);
        (temp, storage, app)
    }

    fn authorization(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    fn request(method: Method, uri: &str, credentials: Option<&str>) -> Request<AxumBody> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(credentials) = credentials {
            builder = builder.header(header::AUTHORIZATION, credentials);
        }
        builder.body(AxumBody::empty()).expect("request")
    }

    async fn send(app: &Router, request: Request<AxumBody>) -> Response {
        app.clone().oneshot(request).await.expect("infallible")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn missing_or_bad_credentials_get_challenge() {
        let (_temp, storage, app) = make_app().await;
        std::fs::write(storage.root_path().join("secret.txt"), b"top secret").expect("write");

        let wrong = authorization(USER, "nope");
        for credentials in [None, Some(wrong.as_str()), Some("Basic !!!")] {
            for method in [Method::GET, Method::HEAD, Method::POST] {
                let response =
                    send(&app, request(method.clone(), "/secret.txt", credentials)).await;
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method}");
                assert_eq!(
                    response.headers()[header::WWW_AUTHENTICATE],
                    r#"Basic realm="drop-serve""#
                );
                assert!(response.headers().contains_key(header::CONTENT_TYPE));
                let body = body_bytes(response).await;
                assert!(!String::from_utf8_lossy(&body).contains("top secret"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_auth_waits_before_challenge() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("public");
        std::fs::create_dir_all(&root).expect("create root");
        let storage = Arc::new(Storage::open(root).await.expect("open storage"));
        let app = build_router(storage, Arc::new(AuthConfig::new(USER, PASS)));

        let wrong = authorization(USER, "nope");
        for credentials in [None, Some(wrong.as_str())] {
            let started = tokio::time::Instant::now();
            let response = send(&app, request(Method::GET, "/", credentials)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(started.elapsed() >= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn authenticated_get_and_head() {
        let (_temp, storage, app) = make_app().await;
        std::fs::write(storage.root_path().join("a.txt"), b"hello").expect("write");
        let credentials = authorization(USER, PASS);

        let get = send(&app, request(Method::GET, "/a.txt", Some(&credentials))).await;
        let head = send(&app, request(Method::HEAD, "/a.txt", Some(&credentials))).await;
        assert_eq!(get.status(), StatusCode::OK);
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(get.headers()[header::CONTENT_TYPE], head.headers()[header::CONTENT_TYPE]);
        assert_eq!(
            get.headers()[header::CONTENT_LENGTH],
            head.headers()[header::CONTENT_LENGTH]
        );
        assert_eq!(body_bytes(get).await, b"hello");
        assert!(body_bytes(head).await.is_empty());

        let missing = send(&app, request(Method::GET, "/nope", Some(&credentials))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let (_temp, _storage, app) = make_app().await;
        let credentials = authorization(USER, PASS);
        let payload: &[u8] = b"first line\r\nsecond line\n\x00\x01binary\r\n";
        let mut body = Vec::new();
        body.extend_from_slice(b"--XyZ\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"notes.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n--XyZ--\r\n");

        let upload = Request::post("/")
            .header(header::AUTHORIZATION, &credentials)
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XyZ")
            .header(header::CONTENT_LENGTH, body.len())
            .body(AxumBody::from(body))
            .expect("request");
        let response = send(&app, upload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await).expect("utf8");
        assert!(page.contains("<strong>Success:</strong>"), "{page}");
        assert!(page.contains(r#"<a href="None">back</a>"#));

        let download = send(&app, request(Method::GET, "/notes.bin", Some(&credentials))).await;
        assert_eq!(download.status(), StatusCode::OK);
        assert_eq!(body_bytes(download).await, payload);
    }

    #[tokio::test]
    async fn listing_is_case_insensitive() {
        let (_temp, storage, app) = make_app().await;
        std::fs::write(storage.root_path().join("Beta"), b"").expect("write");
        std::fs::write(storage.root_path().join("alpha"), b"").expect("write");
        let credentials = authorization(USER, PASS);

        let response = send(&app, request(Method::GET, "/", Some(&credentials))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await).expect("utf8");
        let alpha = page.find(">alpha<").expect("alpha listed");
        let beta = page.find(">Beta<").expect("Beta listed");
        assert!(alpha < beta);
    }
}
