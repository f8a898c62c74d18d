//! GET/HEAD 静态文件与目录服务。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::INDEX_FILES;
use crate::error::ApiError;
use crate::listing::render_listing;
use crate::storage::Storage;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 源码类扩展名按纯文本返回，优先于 MIME 表。
const CONTENT_TYPE_OVERRIDES: [(&str, &str); 3] =
    [("py", "text/plain"), ("c", "text/plain"), ("h", "text/plain")];

/// 处理 GET 与 HEAD：文件、索引页或目录列表。HEAD 只返回响应头。
pub async fn serve_path(
    method: Method,
    uri: Uri,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let head_only = method == Method::HEAD;
    let target = storage.resolve(uri.path()).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;

    if metadata.is_dir() {
        return match find_index(&storage, &target).await {
            Some(index) => serve_file(&index, head_only).await,
            None => serve_listing(&storage, &target, uri.path(), head_only).await,
        };
    }
    serve_file(&target, head_only).await
}

async fn find_index(storage: &Storage, dir: &Path) -> Option<PathBuf> {
    for name in INDEX_FILES {
        let candidate = dir.join(name);
        if storage.ensure_contained(&candidate, false).await.is_ok()
            && fs::metadata(&candidate)
                .await
                .is_ok_and(|metadata| metadata.is_file())
        {
            return Some(candidate);
        }
    }
    None
}

async fn serve_file(path: &Path, head_only: bool) -> Result<Response, ApiError> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::NotFound("File not found".into()))?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound("File not found".into()));
    }
    let content_type = guess_content_type(path);
    let headers = response_headers(&content_type, metadata.len())?;

    if head_only {
        debug!(path = ?path, "head file");
        return Ok((StatusCode::OK, headers, AxumBody::empty()).into_response());
    }
    info!(path = ?path, size = metadata.len(), "serve file");
    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

async fn serve_listing(
    storage: &Storage,
    dir: &Path,
    request_path: &str,
    head_only: bool,
) -> Result<Response, ApiError> {
    let entries = storage
        .list_dir(dir)
        .await
        .map_err(|_| ApiError::NotFound("No permission to list directory".into()))?;
    let page = render_listing(request_path, &entries);
    let headers = response_headers("text/html; charset=utf-8", page.len() as u64)?;
    info!(path = request_path, count = entries.len(), "list directory");

    let body = if head_only {
        AxumBody::empty()
    } else {
        AxumBody::from(page)
    };
    Ok((StatusCode::OK, headers, body).into_response())
}

fn response_headers(content_type: &str, length: u64) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    Ok(headers)
}

/// 按扩展名推断 Content-Type：先原样匹配，再转小写匹配，否则为二进制流。
///
/// `mime_guess` 本身不区分大小写，所以两次匹配只对覆盖表有意义。
pub fn guess_content_type(path: &Path) -> String {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return DEFAULT_CONTENT_TYPE.to_string();
    };
    lookup_override(ext)
        .or_else(|| lookup_override(&ext.to_lowercase()))
        .map(str::to_string)
        .or_else(|| {
            mime_guess::from_ext(ext)
                .first()
                .map(|mime| mime.essence_str().to_string())
        })
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

fn lookup_override(ext: &str) -> Option<&'static str> {
    CONTENT_TYPE_OVERRIDES
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, content_type)| *content_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("public");
        std::fs::create_dir_all(&root).expect("create root");
        let storage = Storage::open(root).await.expect("open storage");
        (temp, Arc::new(storage))
    }

    async fn call(storage: &Arc<Storage>, method: Method, path: &str) -> Result<Response, ApiError> {
        serve_path(
            method,
            path.parse().expect("uri"),
            Extension(storage.clone()),
        )
        .await
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

    #[test]
    fn content_type_lookup() {
        assert_eq!(guess_content_type(Path::new("a.html")), "text/html");
        assert_eq!(guess_content_type(Path::new("A.PNG")), "image/png");
        assert_eq!(guess_content_type(Path::new("script.py")), "text/plain");
        assert_eq!(guess_content_type(Path::new("MAIN.C")), "text/plain");
        assert_eq!(guess_content_type(Path::new("blob")), DEFAULT_CONTENT_TYPE);
        assert_eq!(
            guess_content_type(Path::new("x.unknownext")),
            DEFAULT_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn get_streams_file_contents() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("a.txt"), b"hello").expect("write");

        let response = call(&storage, Method::GET, "/a.txt").await.expect("get");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(body_bytes(response).await, b"hello");
    }

    #[tokio::test]
    async fn head_matches_get_headers_without_body() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("data.bin"), [0u8, 1, 2, 3]).expect("write");

        let get = call(&storage, Method::GET, "/data.bin").await.expect("get");
        let head = call(&storage, Method::HEAD, "/data.bin").await.expect("head");
        assert_eq!(get.status(), head.status());
        assert_eq!(get.headers(), head.headers());
        assert!(body_bytes(head).await.is_empty());
    }

    #[tokio::test]
    async fn directory_prefers_index_html() {
        let (_temp, storage) = make_storage().await;
        let site = storage.root_path().join("site");
        std::fs::create_dir(&site).expect("mkdir");
        std::fs::write(site.join("index.htm"), b"htm").expect("write");
        std::fs::write(site.join("index.html"), b"html").expect("write");

        let response = call(&storage, Method::GET, "/site/").await.expect("get");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(body_bytes(response).await, b"html");
    }

    #[tokio::test]
    async fn directory_without_index_is_listed() {
        let (_temp, storage) = make_storage().await;
        std::fs::write(storage.root_path().join("Beta.txt"), b"").expect("write");
        std::fs::write(storage.root_path().join("alpha.txt"), b"").expect("write");

        let response = call(&storage, Method::GET, "/").await.expect("get");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        let page = String::from_utf8(body_bytes(response).await).expect("utf8");
        let alpha = page.find(">alpha.txt<").expect("alpha listed");
        let beta = page.find(">Beta.txt<").expect("Beta listed");
        assert!(alpha < beta);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_temp, storage) = make_storage().await;
        let result = call(&storage, Method::GET, "/nope.txt").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_never_leaves_root() {
        let (temp, storage) = make_storage().await;
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("write");

        let result = call(&storage, Method::GET, "/../secret.txt").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        let result = call(&storage, Method::GET, "/%2e%2e/secret.txt").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
