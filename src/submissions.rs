//! 作业上传与提交列表处理器。

use axum::extract::{Extension, Multipart, Path};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use crate::archive::{extract_archive, is_archive};
use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::storage::{Storage, StorageError, WeekListing, sanitize_file_name};

/// 上传文件字段的元数据。
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: Option<String>,
}

/// 提交保存后的落盘位置。
#[derive(Debug)]
pub struct StoredSubmission {
    pub student_id: String,
    pub file_name: String,
    pub raw_path: PathBuf,
    pub raw_url: String,
    pub extracted_root: Option<PathBuf>,
    pub extracted_url: Option<String>,
    pub extracted_files: usize,
    pub student_url: String,
}

impl StoredSubmission {
    pub fn extracted(&self) -> bool {
        self.extracted_root.is_some()
    }
}

/// 保存上传文件；若为压缩包则解压到同级 `extracted/` 目录。
///
/// 原始文件总会保留；解压失败时原始文件已写入，
/// 再返回 [`StorageError::Archive`]。
pub async fn store_submission<R>(
    storage: &Storage,
    student_id: &str,
    week: &str,
    upload: &UploadedFile,
    reader: &mut R,
) -> Result<StoredSubmission, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let week_dir = storage.week_dir(student_id, week)?;
    let file_name = sanitize_file_name(&upload.file_name)?;
    fs::create_dir_all(&week_dir.path).await?;

    let raw_path = week_dir.path.join(&file_name);
    let mut atomic = AtomicFile::new(&raw_path).await?;
    let bytes = match tokio::io::copy(reader, atomic.file_mut()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            atomic.cleanup().await;
            return Err(StorageError::Io(err));
        }
    };
    atomic.finalize().await?;
    info!(
        student_id,
        week = week_dir.name,
        file = file_name,
        bytes,
        "stored upload"
    );

    let mut stored = StoredSubmission {
        student_id: student_id.to_string(),
        raw_url: format!("{}/{file_name}", week_dir.url_prefix()),
        file_name,
        raw_path,
        extracted_root: None,
        extracted_url: None,
        extracted_files: 0,
        student_url: format!("/student/{student_id}"),
    };

    if is_archive(upload.content_type.as_deref(), &stored.file_name) {
        let extracted_root = week_dir.extracted_root();
        let count = extract_archive(stored.raw_path.clone(), extracted_root.clone()).await?;
        info!(
            student_id,
            week = week_dir.name,
            file = stored.file_name,
            entries = count,
            "extracted archive"
        );
        stored.extracted_root = Some(extracted_root);
        stored.extracted_url = Some(week_dir.extracted_url());
        stored.extracted_files = count;
    }

    Ok(stored)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    message: &'static str,
    student_id: String,
    week: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extracted_path: Option<String>,
    student_url: String,
}

impl UploadResponse {
    fn new(stored: StoredSubmission, week: String) -> Self {
        if stored.extracted() {
            Self {
                message: "file uploaded and extracted",
                student_id: stored.student_id,
                week,
                original_file: Some(stored.file_name),
                path: None,
                extracted_path: stored.extracted_url,
                student_url: stored.student_url,
            }
        } else {
            Self {
                message: "file uploaded",
                student_id: stored.student_id,
                week,
                original_file: None,
                path: Some(stored.raw_url),
                extracted_path: None,
                student_url: stored.student_url,
            }
        }
    }
}

/// 处理 multipart 上传：`studentId`、`week` 需位于文件字段之前。
pub async fn upload_submission(
    Extension(storage): Extension<Arc<Storage>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let mut student_id: Option<String> = None;
    let mut week: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "studentId" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                student_id = Some(value.trim().to_string());
            }
            "week" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                week = Some(value.trim().to_string());
            }
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    continue;
                }
                let (Some(student_id), Some(week)) = (student_id, week) else {
                    return Err(ApiError::BadRequest(
                        "studentId and week must be sent before the file".into(),
                    ));
                };
                let upload = UploadedFile {
                    file_name,
                    content_type: field.content_type().map(str::to_string),
                };
                let stream = field.map(|chunk| chunk.map_err(|err| io::Error::other(err.to_string())));
                let reader = StreamReader::new(stream);
                tokio::pin!(reader);

                let stored = store_submission(&storage, &student_id, &week, &upload, &mut reader)
                    .await
                    .map_err(upload_error)?;
                info!(
                    student_id,
                    week,
                    extracted_files = stored.extracted_files,
                    "upload accepted"
                );
                return Ok(JsonResponse(UploadResponse::new(stored, week)));
            }
            other => debug!(field = other, "ignore multipart field"),
        }
    }

    Err(ApiError::BadRequest("no file uploaded".into()))
}

fn upload_error(err: StorageError) -> ApiError {
    match err {
        StorageError::InvalidPath => {
            ApiError::BadRequest("invalid student id, week or file name".into())
        }
        other => {
            error!(error = %other, "failed to process upload");
            ApiError::Processing {
                error: "failed to process uploaded file".into(),
                details: other.to_string(),
            }
        }
    }
}

/// 列出学生所有周次的文件（含解压内容）。
pub async fn list_submissions(
    Path(student_id): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<WeekListing>>, ApiError> {
    let weeks = storage.list_submissions(&student_id).await?;
    info!(student_id, weeks = weeks.len(), "list submissions");
    Ok(JsonResponse(weeks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use std::io::{Cursor, Write};
    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    const BOUNDARY: &str = "classdrop-test-boundary";

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Arc::new(Storage::new(root)))
    }

    fn zip_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .expect("start file");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content_type, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn multipart(body: Vec<u8>) -> Multipart {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extractor failed"))
    }

    fn upload(name: &str, content_type: Option<&str>) -> UploadedFile {
        UploadedFile {
            file_name: name.to_string(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn plain_file_is_stored_and_listed() {
        let (_temp, storage) = make_storage();
        let stored = store_submission(
            &storage,
            "s1",
            "3",
            &upload("notes.txt", Some("text/plain")),
            &mut &b"hello"[..],
        )
        .await
        .expect("store");

        assert!(!stored.extracted());
        assert_eq!(stored.raw_url, "/uploads/s1/week3/notes.txt");
        assert_eq!(stored.student_url, "/student/s1");
        assert_eq!(std::fs::read(&stored.raw_path).expect("read"), b"hello");

        let listing = storage.list_submissions("s1").await.expect("list");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].week, "week3");
        assert_eq!(listing[0].files.len(), 1);
        assert_eq!(listing[0].files[0].name, "notes.txt");
        assert_eq!(listing[0].files[0].path, "/uploads/s1/week3/notes.txt");
    }

    #[tokio::test]
    async fn zip_name_triggers_extraction_regardless_of_type() {
        let (_temp, storage) = make_storage();
        let archive = zip_fixture(&[("index.html", b"<p>hi</p>"), ("js/sketch.js", b"draw()")]);
        let stored = store_submission(
            &storage,
            "s1",
            "1",
            &upload("hw.zip", Some("application/octet-stream")),
            &mut archive.as_slice(),
        )
        .await
        .expect("store");

        assert!(stored.extracted());
        assert_eq!(stored.extracted_files, 2);
        assert_eq!(
            stored.extracted_url.as_deref(),
            Some("/uploads/s1/week1/extracted")
        );
        assert!(stored.raw_path.exists());

        let listing = storage.list_submissions("s1").await.expect("list");
        let mut names: Vec<_> = listing[0].files.iter().map(|f| f.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["hw.zip", "index.html", "js/sketch.js"]);
        assert!(
            listing[0]
                .files
                .iter()
                .any(|f| f.path == "/uploads/s1/week1/extracted/js/sketch.js")
        );
    }

    #[tokio::test]
    async fn reupload_overwrites_and_keeps_other_entries() {
        let (_temp, storage) = make_storage();
        let first = zip_fixture(&[("index.html", b"v1"), ("old.txt", b"old")]);
        let second = zip_fixture(&[("index.html", b"v2")]);
        let file = upload("hw.zip", Some("application/zip"));

        store_submission(&storage, "s1", "2", &file, &mut first.as_slice())
            .await
            .expect("first store");
        let stored = store_submission(&storage, "s1", "2", &file, &mut second.as_slice())
            .await
            .expect("second store");

        let root = stored.extracted_root.expect("extracted root");
        assert_eq!(std::fs::read(root.join("index.html")).expect("read"), b"v2");
        assert_eq!(std::fs::read(root.join("old.txt")).expect("read"), b"old");
        assert_eq!(std::fs::read(&stored.raw_path).expect("read"), second);
    }

    #[tokio::test]
    async fn identical_uploads_are_idempotent() {
        let (_temp, storage) = make_storage();
        let archive = zip_fixture(&[("a/b.txt", b"b"), ("c.txt", b"c")]);
        let file = upload("hw.zip", None);

        store_submission(&storage, "s1", "5", &file, &mut archive.as_slice())
            .await
            .expect("first store");
        let before = storage.list_submissions("s1").await.expect("list");
        store_submission(&storage, "s1", "5", &file, &mut archive.as_slice())
            .await
            .expect("second store");
        let after = storage.list_submissions("s1").await.expect("list");

        let collect = |weeks: &Vec<WeekListing>| {
            let mut paths: Vec<_> = weeks[0].files.iter().map(|f| f.path.clone()).collect();
            paths.sort();
            paths
        };
        assert_eq!(collect(&before), collect(&after));
    }

    #[tokio::test]
    async fn corrupt_archive_keeps_raw_upload() {
        let (_temp, storage) = make_storage();
        let result = store_submission(
            &storage,
            "s1",
            "1",
            &upload("broken.zip", Some("application/zip")),
            &mut &b"not a zip"[..],
        )
        .await;

        assert!(matches!(result, Err(StorageError::Archive(_))));
        let raw = storage.root_path().join("s1/week1/broken.zip");
        assert_eq!(std::fs::read(raw).expect("raw kept"), b"not a zip");
    }

    #[tokio::test]
    async fn rejects_traversal_in_identifiers() {
        let (temp, storage) = make_storage();
        let result = store_submission(
            &storage,
            "../escape",
            "1",
            &upload("a.txt", None),
            &mut &b"x"[..],
        )
        .await;

        assert!(matches!(result, Err(StorageError::InvalidPath)));
        assert!(!temp.path().join("escape").exists());
    }

    #[tokio::test]
    async fn upload_handler_returns_extraction_summary() {
        let (_temp, storage) = make_storage();
        let archive = zip_fixture(&[("index.html", b"<h1>hi</h1>")]);
        let body = multipart_body(
            &[("studentId", "s42"), ("week", "7")],
            Some(("hw7.zip", "application/zip", &archive)),
        );

        let JsonResponse(response) = upload_submission(Extension(storage.clone()), multipart(body).await)
            .await
            .unwrap_or_else(|_| panic!("upload failed"));

        assert_eq!(response.student_id, "s42");
        assert_eq!(response.week, "7");
        assert_eq!(response.original_file.as_deref(), Some("hw7.zip"));
        assert_eq!(
            response.extracted_path.as_deref(),
            Some("/uploads/s42/week7/extracted")
        );
        assert_eq!(response.student_url, "/student/s42");
        assert!(response.path.is_none());
        assert!(
            storage
                .root_path()
                .join("s42/week7/extracted/index.html")
                .exists()
        );
    }

    #[tokio::test]
    async fn upload_handler_reports_plain_path() {
        let (_temp, storage) = make_storage();
        let body = multipart_body(
            &[("studentId", "s42"), ("week", "1")],
            Some(("essay.txt", "text/plain", b"words")),
        );

        let JsonResponse(response) = upload_submission(Extension(storage), multipart(body).await)
            .await
            .unwrap_or_else(|_| panic!("upload failed"));

        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["path"], "/uploads/s42/week1/essay.txt");
        assert_eq!(value["studentUrl"], "/student/s42");
        assert!(value.get("extractedPath").is_none());
        assert!(value.get("originalFile").is_none());
    }

    #[tokio::test]
    async fn upload_handler_accepts_punctuation_in_file_name() {
        let (_temp, storage) = make_storage();
        let body = multipart_body(
            &[("studentId", "s42"), ("week", "2")],
            Some(("John's project.txt", "text/plain", b"mine")),
        );

        let JsonResponse(response) = upload_submission(Extension(storage.clone()), multipart(body).await)
            .await
            .unwrap_or_else(|_| panic!("upload failed"));
        assert_eq!(
            response.path.as_deref(),
            Some("/uploads/s42/week2/John's project.txt")
        );

        let listing = storage.list_submissions("s42").await.expect("list");
        assert_eq!(listing[0].files[0].name, "John's project.txt");
        assert_eq!(
            std::fs::read(storage.root_path().join("s42/week2/John's project.txt"))
                .expect("read"),
            b"mine"
        );
    }

    #[tokio::test]
    async fn zip_with_percent_and_hash_in_name_is_extracted() {
        let (_temp, storage) = make_storage();
        let archive = zip_fixture(&[("index.html", b"<p>hi</p>")]);
        let stored = store_submission(
            &storage,
            "s1",
            "2",
            &upload("hw#2 100%.zip", Some("application/zip")),
            &mut archive.as_slice(),
        )
        .await
        .expect("store");

        assert_eq!(stored.file_name, "hw#2 100%.zip");
        assert!(stored.raw_path.exists());
        assert_eq!(stored.extracted_files, 1);
    }

    #[tokio::test]
    async fn week_value_is_prefixed_literally() {
        let (_temp, storage) = make_storage();
        let stored = store_submission(
            &storage,
            "s1",
            "week3",
            &upload("a.txt", None),
            &mut &b"x"[..],
        )
        .await
        .expect("store");

        assert_eq!(stored.raw_url, "/uploads/s1/weekweek3/a.txt");
        assert!(storage.root_path().join("s1/weekweek3/a.txt").exists());
        assert!(!storage.root_path().join("s1/week3").exists());
    }

    #[tokio::test]
    async fn upload_without_file_is_bad_request() {
        let (_temp, storage) = make_storage();
        let body = multipart_body(&[("studentId", "s42"), ("week", "1")], None);

        let result = upload_submission(Extension(storage), multipart(body).await).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn upload_with_file_before_ids_is_bad_request() {
        let (_temp, storage) = make_storage();
        let body = multipart_body(&[], Some(("a.txt", "text/plain", b"x")));

        let result = upload_submission(Extension(storage), multipart(body).await).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn corrupt_archive_upload_is_processing_error() {
        let (_temp, storage) = make_storage();
        let body = multipart_body(
            &[("studentId", "s1"), ("week", "1")],
            Some(("hw.zip", "application/zip", b"garbage")),
        );

        let result = upload_submission(Extension(storage), multipart(body).await).await;
        assert!(matches!(result, Err(ApiError::Processing { .. })));
    }

    #[tokio::test]
    async fn list_handler_returns_empty_for_new_student() {
        let (_temp, storage) = make_storage();
        let JsonResponse(weeks) = list_submissions(Path("fresh".to_string()), Extension(storage))
            .await
            .unwrap_or_else(|_| panic!("list failed"));
        assert!(weeks.is_empty());
    }
}
