//! 嵌入式前端页面：上传表单与学生作品页。

use axum::body::Body as AxumBody;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "public"]
/// 嵌入式静态页面。
pub struct FrontendAssets;

const INDEX_PAGE: &str = "index.html";
const STUDENT_PAGE: &str = "student.html";

/// `GET /`：上传表单。
pub async fn serve_index() -> Result<Response, ApiError> {
    load_page(INDEX_PAGE)
}

/// `GET /student/{studentId}`：作品页，由前端脚本根据路径拉取文件列表。
pub async fn serve_student_page(Path(_student_id): Path<String>) -> Result<Response, ApiError> {
    load_page(STUDENT_PAGE)
}

/// 其余静态资源（脚本、样式）。
pub async fn serve_frontend(req: Request<AxumBody>) -> Result<Response, ApiError> {
    let path = req.uri().path().trim_start_matches('/');
    let requested = if path.is_empty() { INDEX_PAGE } else { path };
    load_embedded_asset(requested)?.ok_or_else(|| ApiError::NotFound("not found".into()))
}

fn load_page(path: &str) -> Result<Response, ApiError> {
    load_embedded_asset(path)?
        .ok_or_else(|| ApiError::Internal(format!("missing embedded page {path}")))
}

/// 加载指定路径的嵌入式资源。
fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = FrontendAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}
