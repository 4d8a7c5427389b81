//! 上传写入：先写隐藏的临时分片文件，校验通过后再原子重命名。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::PARTIAL_UPLOAD_MARKER;

#[derive(Debug)]
pub enum IntakeError {
    TooLarge,
    Io(io::Error),
}

impl From<io::Error> for IntakeError {
    fn from(err: io::Error) -> Self {
        IntakeError::Io(err)
    }
}

/// Partial upload written under a hidden name next to its final target.
pub struct AtomicFile {
    temp_path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
}

/// 写入完成、尚未转正的上传分片。
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl AtomicFile {
    /// 在目标同目录创建隐藏的临时文件。
    pub async fn create(target: &Path, limit: u64) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "upload".into());
        let temp_path = parent.join(partial_name(&base));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            temp_path,
            file,
            written: 0,
            limit,
        })
    }

    /// 追加一块数据；超过上限时返回 `TooLarge`，调用方负责 `discard`。
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IntakeError> {
        let next = self.written + chunk.len() as u64;
        if self.limit > 0 && next > self.limit {
            return Err(IntakeError::TooLarge);
        }
        self.file.write_all(chunk).await?;
        self.written = next;
        Ok(())
    }

    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// Flushes the data and closes the file. The partial keeps its hidden
    /// name until it is promoted, so the sweep reclaims it if nobody does.
    pub async fn finish(self) -> io::Result<StagedFile> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        drop(self.file);
        Ok(StagedFile {
            path: self.temp_path,
            size: self.written,
        })
    }
}

/// 将分片重命名为最终文件并同步目录。
pub async fn promote(staged: &Path, target: &Path) -> io::Result<()> {
    fs::rename(staged, target).await?;
    if let Some(parent) = target.parent() {
        let _ = sync_dir(parent).await;
    }
    Ok(())
}

pub fn partial_name(base: &str) -> String {
    format!(".{base}{PARTIAL_UPLOAD_MARKER}{}", Uuid::new_v4())
}

pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(PARTIAL_UPLOAD_MARKER)
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
