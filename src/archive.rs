//! 压缩包识别与解压：解压到周次目录下的 `extracted/`。

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;
use zip::result::ZipError;

/// 声明类型包含 `zip` 或文件名以 `.zip` 结尾即视为压缩包。
pub fn is_archive(content_type: Option<&str>, file_name: &str) -> bool {
    content_type.is_some_and(|value| value.contains("zip")) || file_name.ends_with(".zip")
}

/// 将 `archive` 的全部条目解压到 `target`，覆盖已有文件，返回写入的文件数。
pub async fn extract_archive(archive: PathBuf, target: PathBuf) -> Result<usize, ArchiveError> {
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &target))
        .await
        .map_err(|err| ArchiveError::Io(io::Error::other(err.to_string())))?
}

fn extract_blocking(archive: &Path, target: &Path) -> Result<usize, ArchiveError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    fs::create_dir_all(target)?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "skip archive entry outside extraction root");
            continue;
        };
        let destination = target.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(&destination)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false)
        {
            warn!(path = ?destination, "skip archive entry over existing symlink");
            continue;
        }

        let mut output = File::create(&destination)?;
        let bytes = io::copy(&mut entry, &mut output)?;
        debug!(path = ?relative, bytes, "extracted archive entry");
        written += 1;
    }

    Ok(written)
}

#[derive(Debug)]
pub enum ArchiveError {
    Zip(ZipError),
    Io(io::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Zip(err) => write!(f, "invalid zip archive: {err}"),
            ArchiveError::Io(err) => write!(f, "archive extraction failed: {err}"),
        }
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        ArchiveError::Zip(err)
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Io(err)
    }
}
