use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::archive::ArchiveError;
use crate::atomic::is_temp_file_name;
use crate::config::{EXTRACTED_DIR, UPLOADS_URL_PREFIX};

/// 学号、周次中禁止出现的字符（它们会被拼进 URL 与注入的 `<base>`）。
const FORBIDDEN_SEGMENT_CHARS: &[char] = &[
    '/', '\\', '\0', '"', '\'', '<', '>', '`', '?', '#', '%',
];

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// 已校验的 `{root}/{studentId}/week{week}` 目录。
#[derive(Clone, Debug)]
pub struct WeekDir {
    pub student_id: String,
    pub name: String,
    pub path: PathBuf,
}

impl WeekDir {
    pub fn extracted_root(&self) -> PathBuf {
        self.path.join(EXTRACTED_DIR)
    }

    /// 对外 URL 前缀，例如 `/uploads/s123/week3`。
    pub fn url_prefix(&self) -> String {
        format!("{UPLOADS_URL_PREFIX}/{}/{}", self.student_id, self.name)
    }

    pub fn extracted_url(&self) -> String {
        format!("{}/{EXTRACTED_DIR}", self.url_prefix())
    }
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn student_dir(&self, student_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_segment(student_id)?))
    }

    pub fn week_dir(&self, student_id: &str, week: &str) -> Result<WeekDir, StorageError> {
        let student_dir = self.student_dir(student_id)?;
        let name = week_dir_name(validate_segment(week)?);
        Ok(WeekDir {
            student_id: student_id.to_string(),
            path: student_dir.join(&name),
            name,
        })
    }

    /// 解析预览目标：只允许落在 `extracted/` 之下，且不经过符号链接。
    pub async fn resolve_preview(
        &self,
        student_id: &str,
        week: &str,
        relative: &str,
    ) -> Result<PathBuf, StorageError> {
        let student_id = validate_segment(student_id)?;
        let week_name = preview_week_name(validate_segment(week)?);
        let relative = format!(
            "{student_id}/{week_name}/{EXTRACTED_DIR}/{}",
            relative.trim_start_matches(['/', '\\'])
        );
        let target = self.resolve(&relative)?;
        self.ensure_no_symlink_components(&target).await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(&self, target: &Path) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 列出学生的全部周次提交；学生目录不存在时返回空列表。
    pub async fn list_submissions(
        &self,
        student_id: &str,
    ) -> Result<Vec<WeekListing>, StorageError> {
        let student_dir = self.student_dir(student_id)?;
        let mut weeks = match fs::read_dir(&student_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let mut result = Vec::new();
        while let Some(entry) = weeks.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let week = entry.file_name().to_string_lossy().to_string();
            let week_path = entry.path();
            let url_prefix = format!("{UPLOADS_URL_PREFIX}/{student_id}/{week}");

            let mut files = Vec::new();
            let mut dir = fs::read_dir(&week_path).await?;
            while let Some(file) = dir.next_entry().await? {
                let name = file.file_name().to_string_lossy().to_string();
                if name == EXTRACTED_DIR || is_temp_file_name(&name) {
                    continue;
                }
                files.push(FileEntry {
                    path: format!("{url_prefix}/{name}"),
                    name,
                });
            }

            let extracted_root = week_path.join(EXTRACTED_DIR);
            if fs::metadata(&extracted_root)
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false)
            {
                for file in walk_files(&extracted_root).await? {
                    let relative = file
                        .strip_prefix(&extracted_root)
                        .map_err(|_| StorageError::InvalidPath)?
                        .to_string_lossy()
                        .replace(std::path::MAIN_SEPARATOR, "/");
                    files.push(FileEntry {
                        path: format!("{url_prefix}/{EXTRACTED_DIR}/{relative}"),
                        name: relative,
                    });
                }
            }

            result.push(WeekListing { week, files });
        }

        Ok(result)
    }
}

/// 深度优先遍历 `root` 下的全部普通文件；符号链接既不跟随也不返回。
pub async fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![fs::read_dir(root).await?];

    while let Some(dir) = stack.last_mut() {
        match dir.next_entry().await? {
            Some(entry) => {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(fs::read_dir(entry.path()).await?);
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
            None => {
                stack.pop();
            }
        }
    }

    Ok(files)
}

/// 校验来自请求的单个路径段（学号、周次）。
pub fn validate_segment(value: &str) -> Result<&str, StorageError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(FORBIDDEN_SEGMENT_CHARS)
        || value.chars().any(char::is_control)
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(value)
}

/// 上传落盘的周次目录名：总是 `week{week}`，`week3` 会得到 `weekweek3`。
pub fn week_dir_name(week: &str) -> String {
    format!("week{week}")
}

/// 预览路由的周次目录名：作品页使用列表返回的目录名（`week3`）拼接预览 URL，
/// 因此已带前缀的值原样使用，否则补上前缀。
pub fn preview_week_name(week: &str) -> String {
    match week.strip_prefix("week") {
        Some(rest) if !rest.is_empty() => week.to_string(),
        _ => format!("week{week}"),
    }
}

/// 上传文件名只保留最后一个路径分量。
///
/// 文件名只作为磁盘上的单个文件落盘，不会进入注入的 HTML，
/// 因此 `'`、`#`、`%` 等字符都允许；仅拒绝空名、`.`/`..`、控制字符、
/// 保留目录名 `extracted` 与原子写入的临时前缀。
pub fn sanitize_file_name(original: &str) -> Result<String, StorageError> {
    let name = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty()
        || name == "."
        || name == ".."
        || name == EXTRACTED_DIR
        || name.chars().any(char::is_control)
        || is_temp_file_name(name)
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(name.to_string())
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
    Archive(ArchiveError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPath => f.write_str("invalid path"),
            StorageError::Io(err) => write!(f, "{err}"),
            StorageError::Archive(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<ArchiveError> for StorageError {
    fn from(err: ArchiveError) -> Self {
        StorageError::Archive(err)
    }
}

#[derive(Debug, Serialize)]
pub struct WeekListing {
    pub week: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
}
