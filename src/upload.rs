//! 单文件 multipart/form-data 上传的流式解析、落盘与校验。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{ContentLength, ContentType, HeaderMapExt};
use futures_util::TryStreamExt;
use html_escape::{encode_double_quoted_attribute, encode_text};
use http_body_util::BodyExt;
use md5::{Digest, Md5};
use mime_guess::mime::{self, Mime};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::{CHECKSUM_CHUNK_SIZE, UPLOAD_CHUNK_SIZE};
use crate::http::{client_addr, referer_or_none};
use crate::storage::Storage;

/// 每个 part 在 Content-Disposition 之后、数据之前固定跳过的行数。
const SKIPPED_PART_HEADER_LINES: u8 = 2;
const FILENAME_MARKER: &str = r#"name="file"; filename=""#;
/// 头部行保留的最大字节数，超出部分读出后丢弃。
const HEADER_LINE_LIMIT: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadMetadata {
    pub filename: String,
    pub checksum: String,
    pub path: PathBuf,
}

/// 上传结果，直接用于渲染结果页。
#[derive(Debug)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    pub metadata: Option<UploadMetadata>,
}

impl From<Result<UploadMetadata, UploadError>> for UploadResult {
    fn from(result: Result<UploadMetadata, UploadError>) -> Self {
        match result {
            Ok(metadata) => Self {
                success: true,
                message: format!(
                    "File '{}' with MD5 {} uploaded!",
                    metadata.filename, metadata.checksum
                ),
                metadata: Some(metadata),
            },
            Err(err) => Self {
                success: false,
                message: err.to_string(),
                metadata: None,
            },
        }
    }
}

#[derive(Debug)]
pub enum UploadError {
    MissingBoundary,
    MissingContentLength,
    NoLeadingBoundary,
    CreateFile,
    UnexpectedEnd,
    Io(io::Error),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::MissingBoundary => {
                f.write_str("Content-Type is not multipart/form-data with a boundary")
            }
            UploadError::MissingContentLength => f.write_str("Content-Length is required"),
            UploadError::NoLeadingBoundary => f.write_str("Content does NOT begin with boundary"),
            UploadError::CreateFile => f.write_str(
                "Can't create file to write, do you have permission to write?",
            ),
            UploadError::UnexpectedEnd => f.write_str("Unexpected end of data."),
            UploadError::Io(err) => write!(f, "Upload failed: {err}"),
        }
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Io(err)
    }
}

enum IngestState {
    ExpectBoundary,
    ExpectDisposition,
    SkipHeaders {
        left: u8,
        filename: String,
    },
    StreamBody {
        filename: String,
        target: PathBuf,
        out: AtomicFile,
        pending: Vec<u8>,
    },
}

enum BodyStep {
    Continue(Vec<u8>),
    Finished,
}

/// 单文件、单 part 的 multipart 解析器。
///
/// 按行读取请求体，`remaining` 以 Content-Length 为初值，每读一段扣减；
/// 读取本身也以它为上限。数据按段读取，每段至多 `UPLOAD_CHUNK_SIZE`
/// 字节并止于 `\n`，超长的行会被拆成多段。数据采用一段前瞻：
/// 行首的段含分隔符时，上一段去掉行尾的 `\n` 与可选的 `\r`
/// 后作为最后一段数据写入。
///
/// 分隔符取 `--` 加 boundary，而不是裸 boundary：只含 boundary 本身的
/// 数据行仍按数据写入。
pub struct MultipartIngestor<R> {
    reader: R,
    delimiter: Vec<u8>,
    remaining: u64,
}

impl<R: AsyncBufRead + Unpin> MultipartIngestor<R> {
    pub fn new(reader: R, boundary: &str, content_length: u64) -> Self {
        Self {
            reader,
            delimiter: format!("--{boundary}").into_bytes(),
            remaining: content_length,
        }
    }

    /// 解析请求体并写入 `dir`，成功时返回文件名、MD5 与落盘路径。
    pub async fn ingest(
        mut self,
        storage: &Storage,
        dir: &Path,
    ) -> Result<UploadMetadata, UploadError> {
        let mut state = IngestState::ExpectBoundary;
        loop {
            state = match state {
                IngestState::ExpectBoundary => {
                    let line = self.next_line().await?;
                    if !contains(&line, &self.delimiter) {
                        return Err(UploadError::NoLeadingBoundary);
                    }
                    IngestState::ExpectDisposition
                }
                IngestState::ExpectDisposition => {
                    let line = self.next_line().await?;
                    let filename =
                        parse_filename(&line).unwrap_or_else(|| Uuid::new_v4().to_string());
                    IngestState::SkipHeaders {
                        left: SKIPPED_PART_HEADER_LINES,
                        filename,
                    }
                }
                IngestState::SkipHeaders { left: 0, filename } => {
                    let target = storage
                        .resolve_child(dir, &filename)
                        .await
                        .map_err(|_| UploadError::CreateFile)?;
                    let out = AtomicFile::new(&target)
                        .await
                        .map_err(|_| UploadError::CreateFile)?;
                    let pending = match self.next_piece(UPLOAD_CHUNK_SIZE).await {
                        Ok(piece) => piece,
                        Err(err) => {
                            out.cleanup().await;
                            return Err(err.into());
                        }
                    };
                    IngestState::StreamBody {
                        filename,
                        target,
                        out,
                        pending,
                    }
                }
                IngestState::SkipHeaders { left, filename } => {
                    self.next_line().await?;
                    IngestState::SkipHeaders {
                        left: left - 1,
                        filename,
                    }
                }
                IngestState::StreamBody {
                    filename,
                    target,
                    mut out,
                    pending,
                } => match self.body_step(&mut out, pending).await {
                    Ok(BodyStep::Continue(pending)) => IngestState::StreamBody {
                        filename,
                        target,
                        out,
                        pending,
                    },
                    Ok(BodyStep::Finished) => {
                        // 在改名之前对临时文件求校验和
                        let checksum = match out.sync().await {
                            Ok(()) => md5_checksum(out.temp_path()).await,
                            Err(err) => Err(err),
                        };
                        let checksum = match checksum {
                            Ok(checksum) => checksum,
                            Err(err) => {
                                out.cleanup().await;
                                return Err(err.into());
                            }
                        };
                        out.finalize().await?;
                        return Ok(UploadMetadata {
                            filename,
                            checksum,
                            path: target,
                        });
                    }
                    Err(err) => {
                        out.cleanup().await;
                        return Err(err);
                    }
                },
            };
        }
    }

    async fn body_step(
        &mut self,
        out: &mut AtomicFile,
        mut pending: Vec<u8>,
    ) -> Result<BodyStep, UploadError> {
        if self.remaining == 0 {
            return Err(UploadError::UnexpectedEnd);
        }
        let piece = self.next_piece(UPLOAD_CHUNK_SIZE).await?;
        if piece.is_empty() {
            return Err(UploadError::UnexpectedEnd);
        }
        // 只有行首的段才可能是分隔符行
        if pending.ends_with(b"\n") && contains(&piece, &self.delimiter) {
            strip_line_terminator(&mut pending);
            out.write_all(&pending).await?;
            return Ok(BodyStep::Finished);
        }
        out.write_all(&pending).await?;
        Ok(BodyStep::Continue(piece))
    }

    /// 读取一个头部行，只保留前 `HEADER_LINE_LIMIT` 字节。
    async fn next_line(&mut self) -> io::Result<Vec<u8>> {
        let line = self.next_piece(HEADER_LINE_LIMIT).await?;
        let mut unfinished = !line.is_empty() && !line.ends_with(b"\n");
        while unfinished {
            let rest = self.next_piece(HEADER_LINE_LIMIT).await?;
            unfinished = !rest.is_empty() && !rest.ends_with(b"\n");
        }
        Ok(line)
    }

    async fn next_piece(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut piece = Vec::new();
        let read = (&mut self.reader)
            .take(self.remaining.min(limit as u64))
            .read_until(b'\n', &mut piece)
            .await?;
        self.remaining -= read as u64;
        Ok(piece)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

fn strip_line_terminator(line: &mut Vec<u8>) {
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
}

/// 从 Content-Disposition 行取 `filename`，只保留最后一个路径段。
fn parse_filename(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let disposition = line
        .get(.."content-disposition".len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("content-disposition"));
    if !disposition {
        return None;
    }
    let start = line.find(FILENAME_MARKER)? + FILENAME_MARKER.len();
    let rest = &line[start..];
    let raw = &rest[..rest.rfind('"')?];
    raw.rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
}

/// 分块读回文件计算 MD5。
pub async fn md5_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn multipart_boundary(headers: &HeaderMap) -> Option<String> {
    let content_type: Mime = headers.typed_get::<ContentType>()?.into();
    if content_type.type_() != mime::MULTIPART || content_type.subtype() != mime::FORM_DATA {
        return None;
    }
    content_type
        .get_param(mime::BOUNDARY)
        .map(|boundary| boundary.as_str().to_string())
        .filter(|boundary| !boundary.is_empty())
}

async fn receive_upload(
    storage: &Storage,
    request_path: &str,
    headers: &HeaderMap,
    body: AxumBody,
) -> Result<UploadMetadata, UploadError> {
    let boundary = multipart_boundary(headers).ok_or(UploadError::MissingBoundary)?;
    let ContentLength(content_length) = headers
        .typed_get::<ContentLength>()
        .ok_or(UploadError::MissingContentLength)?;
    let dir = storage
        .resolve(request_path)
        .await
        .map_err(|_| UploadError::CreateFile)?;
    debug!(dir = ?dir, content_length, "receiving upload");

    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    MultipartIngestor::new(StreamReader::new(stream), &boundary, content_length)
        .ingest(storage, &dir)
        .await
}

/// 上传处理器：无论成败都返回 200 与结果页。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    req: Request<AxumBody>,
) -> Response {
    let (parts, body) = req.into_parts();
    let client_ip = client_addr(&parts.headers, &parts.extensions);
    let referer = referer_or_none(&parts.headers);

    let result = UploadResult::from(
        receive_upload(&storage, parts.uri.path(), &parts.headers, body).await,
    );
    let outcome = outcome_label(result.success);
    info!(
        outcome,
        message = %result.message,
        client_ip = %client_ip,
        path = ?result.metadata.as_ref().map(|metadata| &metadata.path),
        "upload finished"
    );

    let page = render_result_page(&result, &referer);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(page.len()));
    (StatusCode::OK, headers, page).into_response()
}

fn outcome_label(success: bool) -> &'static str {
    if success { "Success" } else { "Failure" }
}

pub fn render_result_page(result: &UploadResult, referer: &str) -> String {
    format!(
        r#"<!DOCTYPE html PUBLIC "-//W3C//DTD HTML 3.2 Final//EN">
<html><title>Upload Result Page</title>
<body><h2>Upload Result Page</h2>
<hr>
<strong>{outcome}:</strong>
{message}
<br><a href="{referer}">back</a>
</body></html>
"#,
        outcome = outcome_label(result.success),
        message = encode_text(&result.message),
        referer = encode_double_quoted_attribute(referer),
    )
}
