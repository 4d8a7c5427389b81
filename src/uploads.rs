//! 上传编排：文件名校验、受限文件操作与结果归类。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::is_partial_name;
use crate::config::UPLOAD_URL_PREFIX;
use crate::safe_fs::{FileOpError, SafeFileOps};
use crate::sanitize::{FilenameRejection, PathError, resolve_safe_path, validate_filename};
use crate::throttle::Denial;

#[derive(Debug)]
pub enum UploadError {
    InvalidFilename(FilenameRejection),
    PathTraversal,
    NotFound,
    Throttled(Denial),
    Io(io::Error),
}

impl From<FileOpError> for UploadError {
    fn from(err: FileOpError) -> Self {
        match err {
            FileOpError::Throttled(denial) => UploadError::Throttled(denial),
            FileOpError::Io(err) => UploadError::Io(err),
        }
    }
}

impl From<FilenameRejection> for UploadError {
    fn from(rejection: FilenameRejection) -> Self {
        UploadError::InvalidFilename(rejection)
    }
}

impl From<PathError> for UploadError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::Traversal => UploadError::PathTraversal,
            PathError::Unresolvable => {
                UploadError::Io(io::Error::new(ErrorKind::InvalidInput, err.to_string()))
            }
        }
    }
}

/// A file the intake layer has staged under a hidden partial name. It only
/// becomes `file_name` once `store_files` accepts it.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFileDescriptor {
    pub id: Uuid,
    pub original_name: String,
    pub file_name: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionKind {
    InvalidFilename,
    PathTraversal,
    Unresolvable,
    UnsupportedMediaType,
    FileTooLarge,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedUpload {
    pub original_name: String,
    pub file_name: Option<String>,
    pub kind: RejectionKind,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct StoreOutcome {
    #[serde(rename = "files")]
    pub stored: Vec<UploadedFileDescriptor>,
    pub rejected: Vec<RejectedUpload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Single entry point for document uploads, deletes and listings.
#[derive(Debug)]
pub struct UploadOrchestrator {
    base_dir: PathBuf,
    ops: SafeFileOps,
}

impl UploadOrchestrator {
    pub fn new(base_dir: PathBuf, ops: SafeFileOps) -> Self {
        Self { base_dir, ops }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ops(&self) -> &SafeFileOps {
        &self.ops
    }

    /// 确保上传目录存在。
    pub async fn prepare(&self, client_id: &str) -> Result<(), UploadError> {
        match self.ops.access(client_id, &self.base_dir).await {
            Ok(()) => Ok(()),
            Err(FileOpError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                self.ops.mkdir(client_id, &self.base_dir).await?;
                info!(dir = ?self.base_dir, "created upload directory");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 校验暂存的上传文件，合法的转正为最终文件名，非法的删除并记录拒绝原因。
    ///
    /// A rejected file whose cleanup is refused keeps its partial name, so the
    /// partial sweep reclaims it later.
    pub async fn store_files(
        &self,
        client_id: &str,
        files: Vec<ReceivedFile>,
    ) -> Result<StoreOutcome, UploadError> {
        let mut outcome = StoreOutcome::default();
        let mut pending = files.into_iter();
        while let Some(file) = pending.next() {
            let target = match validate_filename(&file.file_name) {
                Err(rejection) => Err((RejectionKind::InvalidFilename, rejection.to_string())),
                Ok(name) => resolve_safe_path(name.as_str(), &self.base_dir).map_err(|err| {
                    let kind = match err {
                        PathError::Traversal => RejectionKind::PathTraversal,
                        PathError::Unresolvable => RejectionKind::Unresolvable,
                    };
                    (kind, err.to_string())
                }),
            };

            let target = match target {
                Ok(target) => target,
                Err((kind, reason)) => {
                    warn!(
                        client = client_id,
                        file_name = file.file_name,
                        reason,
                        "rejected uploaded file"
                    );
                    self.discard(client_id, &file.path).await;
                    outcome.rejected.push(RejectedUpload {
                        original_name: file.original_name,
                        file_name: Some(file.file_name),
                        kind,
                        reason,
                    });
                    continue;
                }
            };

            if let Err(err) = self
                .ops
                .rename(client_id, &file.path, target.as_path())
                .await
            {
                self.discard(client_id, &file.path).await;
                for rest in pending {
                    self.discard(client_id, &rest.path).await;
                }
                return Err(err.into());
            }

            info!(
                client = client_id,
                file_name = file.file_name,
                size = file.size,
                "stored uploaded file"
            );
            outcome.stored.push(UploadedFileDescriptor {
                id: Uuid::new_v4(),
                url: public_url(&file.file_name),
                original_name: file.original_name,
                file_name: file.file_name,
                mime_type: file.mime_type,
                size: file.size,
                uploaded_at: Utc::now(),
            });
        }
        Ok(outcome)
    }

    /// Best-effort removal that never replaces the caller's primary outcome.
    async fn discard(&self, client_id: &str, path: &Path) {
        if let Err(err) = self.ops.unlink(client_id, path).await {
            warn!(
                client = client_id,
                path = ?path,
                error = ?err,
                "failed to remove rejected upload"
            );
        }
    }

    pub async fn delete_file(&self, client_id: &str, name: &str) -> Result<(), UploadError> {
        let name = validate_filename(name)?;
        let target = resolve_safe_path(name.as_str(), &self.base_dir)?;
        if self.ops.stat(client_id, target.as_path()).await?.is_none() {
            return Err(UploadError::NotFound);
        }
        self.ops.unlink(client_id, target.as_path()).await?;
        info!(client = client_id, file_name = name.as_str(), "deleted upload");
        Ok(())
    }

    pub async fn list_files(&self, client_id: &str) -> Result<Vec<StoredFile>, UploadError> {
        let names = self.ops.read_dir(client_id, &self.base_dir).await?;
        let mut files = Vec::new();
        for name in names {
            if validate_filename(&name).is_err() {
                continue;
            }
            let Ok(target) = resolve_safe_path(&name, &self.base_dir) else {
                continue;
            };
            let Some(metadata) = self.ops.stat(client_id, target.as_path()).await? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(StoredFile {
                url: public_url(&name),
                mime_type: mime_for(&name),
                size: metadata.len(),
                modified: modified_at(&metadata),
                file_name: name,
            });
        }
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    /// 读取单个已存储文件的内容与元数据。
    pub async fn read_file(
        &self,
        client_id: &str,
        name: &str,
    ) -> Result<(Vec<u8>, Metadata), UploadError> {
        let name = validate_filename(name)?;
        let target = resolve_safe_path(name.as_str(), &self.base_dir)?;
        let metadata = match self.ops.stat(client_id, target.as_path()).await? {
            Some(metadata) if metadata.is_file() => metadata,
            _ => return Err(UploadError::NotFound),
        };
        let contents = match self.ops.read_file(client_id, target.as_path()).await {
            Err(FileOpError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(UploadError::NotFound);
            }
            other => other?,
        };
        Ok((contents, metadata))
    }

    /// 清理中断上传遗留的临时分片文件，返回删除数量。
    pub async fn sweep_partials(
        &self,
        client_id: &str,
        ttl: Duration,
    ) -> Result<usize, UploadError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for name in self.ops.read_dir(client_id, &self.base_dir).await? {
            if !is_partial_name(&name) {
                continue;
            }
            let path = self.base_dir.join(&name);
            let Some(metadata) = self.ops.stat(client_id, &path).await? else {
                continue;
            };
            let stale = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= ttl);
            if stale && metadata.is_file() {
                self.ops.unlink(client_id, &path).await?;
                info!(path = ?path, "removed stale partial upload");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn public_url(file_name: &str) -> String {
    format!("{UPLOAD_URL_PREFIX}/{file_name}")
}

pub fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn modified_at(metadata: &Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}
