//! 目录列表页面渲染。

use html_escape::{encode_double_quoted_attribute, encode_text};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt::Write as FmtWrite;

use crate::config::USAGE_ROUTE;
use crate::storage::DirectoryEntry;

/// 链接中单个路径段需要转义的字符。
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// 渲染目录列表 HTML。
///
/// `request_path` 为原始（未解码）请求路径，标题展示其解码结果，
/// 链接以它为前缀，因此无论请求是否以 `/` 结尾链接都指向正确位置。
pub fn render_listing(request_path: &str, entries: &[DirectoryEntry]) -> String {
    let title = percent_decode_str(request_path).decode_utf8_lossy();
    let title = encode_text(&title);
    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{request_path}/")
    };

    let mut body = String::new();
    let _ = write!(
        body,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>Directory listing for {title}</title></head><body>\n\
         <h2>Directory listing for {title}</h2>\n\
         <li><a href=\"{USAGE_ROUTE}\">Usage Instructions</a>\n\
         <hr>\n<ul>\n"
    );

    for entry in entries {
        let (display_suffix, link_suffix) = entry_suffixes(entry);
        let href = format!(
            "{base}{}{link_suffix}",
            utf8_percent_encode(&entry.name, SEGMENT)
        );
        let _ = writeln!(
            body,
            "<li><a href=\"{}\">{}{display_suffix}</a></li>",
            encode_double_quoted_attribute(&href),
            encode_text(&entry.name),
        );
    }

    body.push_str("</ul>\n<hr>\n</body></html>\n");
    body
}

/// 展示名：目录加 `/`，符号链接加 `@`；链接名只对目录加 `/`。
fn entry_suffixes(entry: &DirectoryEntry) -> (&'static str, &'static str) {
    let link = if entry.is_dir { "/" } else { "" };
    let display = if entry.is_symlink { "@" } else { link };
    (display, link)
}
