//! 预览处理器：HTML 作业注入 base 与 p5.js，其他文件原样返回。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use httpdate::fmt_http_date;
use std::io::ErrorKind;
use std::path::Path as StdPath;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::config::{EXTRACTED_DIR, UPLOADS_URL_PREFIX};
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::storage::{Storage, StorageError, preview_week_name};

pub const DRAWING_LIBRARY_URL: &str = "https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.4.0/p5.js";
pub const DRAWING_SOUND_ADDON_URL: &str =
    "https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.4.0/addons/p5.sound.min.js";

const DRAWING_LIBRARY_MARKERS: &[&str] = &[
    "p5.js",
    "setup()",
    "draw()",
    "function setup",
    "function draw",
    "createCanvas",
];

const BASE_PLACEHOLDER: &str = "__BASE_PATH__";

const INJECTED_HEAD: &str = r#"
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<base href="__BASE_PATH__">
<script src="__DRAWING_LIBRARY__"></script>
<script src="__DRAWING_SOUND_ADDON__"></script>
<style>
  html, body {
    margin: 0;
    padding: 0;
    overflow: hidden;
  }
  canvas {
    display: block;
  }
</style>
<script>
  document.addEventListener('DOMContentLoaded', function () {
    var base = '__BASE_PATH__';
    document.querySelectorAll('img[src], script[src], link[href], source[src]').forEach(function (el) {
      ['src', 'href'].forEach(function (attr) {
        var value = el.getAttribute(attr);
        if (value && value.charAt(0) === '/' && value.charAt(1) !== '/' && value.indexOf(base) !== 0) {
          el.setAttribute(attr, base + value.slice(1));
        }
      });
    });
  });
</script>
"#;

/// 预览时统一返回 404 文案。
const NOT_FOUND_MESSAGE: &str = "file does not exist";

pub fn is_html_path(path: &StdPath) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
}

/// 粗略判断作业是否基于 p5.js；只用于日志，库总会被注入。
pub fn uses_drawing_library(html: &str) -> bool {
    DRAWING_LIBRARY_MARKERS
        .iter()
        .any(|marker| html.contains(marker))
}

/// 预览 `<base>`：`/uploads/{studentId}/{weekDir}/extracted/`。
pub fn preview_base_path(student_id: &str, week_dir: &str) -> String {
    format!("{UPLOADS_URL_PREFIX}/{student_id}/{week_dir}/{EXTRACTED_DIR}/")
}

pub fn injection_fragment(base_path: &str) -> String {
    INJECTED_HEAD
        .replace(BASE_PLACEHOLDER, base_path)
        .replace("__DRAWING_LIBRARY__", DRAWING_LIBRARY_URL)
        .replace("__DRAWING_SOUND_ADDON__", DRAWING_SOUND_ADDON_URL)
}

/// 重写学生提交的 HTML，使其可在预览路由下渲染：
/// 去掉 doctype，补齐 `<html>`、`<head>`、`<body>`，
/// 并在 head 开头注入 [`injection_fragment`]。
pub fn rewrite_html(html: &str, base_path: &str) -> String {
    let mut document = strip_doctype(html);

    if find_open_tag(&document, "html").is_none() {
        document = format!("<html lang=\"en\">{document}</html>");
    }

    let fragment = injection_fragment(base_path);
    if let Some((_, head_end)) = find_open_tag(&document, "head") {
        document.insert_str(head_end, &fragment);
    } else {
        let head = format!("<head>{fragment}</head>");
        let at = find_open_tag(&document, "html").map_or(0, |(_, end)| end);
        document.insert_str(at, &head);
    }

    if find_open_tag(&document, "body").is_none() {
        document = wrap_body(&document);
    }

    document
}

/// 移除第一个 `<!DOCTYPE ...>` 声明（不区分大小写）。
fn strip_doctype(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let Some(start) = lower.find("<!doctype") else {
        return html.to_string();
    };
    let Some(len) = lower[start..].find('>') else {
        return html.to_string();
    };
    let mut stripped = String::with_capacity(html.len());
    stripped.push_str(&html[..start]);
    stripped.push_str(&html[start + len + 1..]);
    stripped
}

/// 查找第一个 `<tag ...>` 开始标签，返回起始偏移与 `>` 之后的偏移；
/// `<header>` 不会匹配 `head`。
fn find_open_tag(html: &str, tag: &str) -> Option<(usize, usize)> {
    let lower = html.to_ascii_lowercase();
    let needle = format!("<{tag}");
    for (start, _) in lower.match_indices(&needle) {
        let after = start + needle.len();
        match lower.as_bytes().get(after).copied() {
            Some(b'>' | b'/') => {}
            Some(byte) if byte.is_ascii_whitespace() => {}
            _ => continue,
        }
        if let Some(close) = lower[after..].find('>') {
            return Some((start, after + close + 1));
        }
    }
    None
}

/// 在第一个 `</head>` 之后切分，剩余内容包进 `<body>`；
/// 末尾的 `</html>` 移到新的 `</body>` 之后。
fn wrap_body(document: &str) -> String {
    let lower = document.to_ascii_lowercase();
    let (before, after) = match lower.find("</head>") {
        Some(index) => (&document[..index], &document[index + "</head>".len()..]),
        None => (document, ""),
    };
    let lower_after = after.to_ascii_lowercase();
    let (content, tail) = match lower_after.rfind("</html>") {
        Some(index) => (&after[..index], &after[index + "</html>".len()..]),
        None => (after, ""),
    };
    format!("{before}</head><body>{content}</body></html>{tail}")
}

/// 预览已解压的文件：HTML 重写后返回，其他类型直接流式返回。
pub async fn preview_file(
    Path((student_id, week, path)): Path<(String, String, String)>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage
        .resolve_preview(&student_id, &week, &path)
        .await
        .map_err(preview_error)?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| preview_error(StorageError::Io(err)))?;
    if metadata.is_dir() {
        return Err(ApiError::NotFound(NOT_FOUND_MESSAGE.into()));
    }

    if is_html_path(&target) {
        let bytes = fs::read(&target).await.map_err(|err| {
            error!(path = ?target, error = %err, "failed to read html for preview");
            ApiError::Internal("failed to process HTML file".into())
        })?;
        let html = String::from_utf8_lossy(&bytes);
        let base_path = preview_base_path(&student_id, &preview_week_name(&week));
        let rendered = rewrite_html(&html, &base_path);
        info!(
            path,
            size = rendered.len(),
            drawing_library = uses_drawing_library(&html),
            "render html preview"
        );
        return Ok(Html(rendered).into_response());
    }

    let etag = etag_from_metadata(&metadata);
    if is_not_modified(&request_headers, &etag) {
        debug!(path, "preview not modified");
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
    );
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag)
            .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
        );
    }

    let file = File::open(&target)
        .await
        .map_err(|err| preview_error(StorageError::Io(err)))?;
    debug!(path, size = metadata.len(), "stream preview file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn preview_error(err: StorageError) -> ApiError {
    match err {
        StorageError::InvalidPath => ApiError::BadRequest("invalid preview path".into()),
        StorageError::Io(err) if err.kind() == ErrorKind::NotFound => {
            ApiError::NotFound(NOT_FOUND_MESSAGE.into())
        }
        other => {
            error!(error = %other, "preview failed");
            ApiError::Internal("failed to read file".into())
        }
    }
}
