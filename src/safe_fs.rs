//! 经过准入控制的文件系统原语。

use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::atomic::promote;
use crate::throttle::{Denial, ThrottleGate};

#[derive(Debug)]
pub enum FileOpError {
    Throttled(Denial),
    Io(io::Error),
}

impl From<Denial> for FileOpError {
    fn from(denial: Denial) -> Self {
        FileOpError::Throttled(denial)
    }
}

impl From<io::Error> for FileOpError {
    fn from(err: io::Error) -> Self {
        FileOpError::Io(err)
    }
}

/// Filesystem primitives that each hold one admission from the gate while
/// their I/O is outstanding.
#[derive(Debug, Clone)]
pub struct SafeFileOps {
    gate: Arc<ThrottleGate>,
}

impl SafeFileOps {
    pub fn new(gate: Arc<ThrottleGate>) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    /// 删除文件；目标不存在时视为成功。
    pub async fn unlink(&self, client_id: &str, path: &Path) -> Result<(), FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(client = client_id, path = ?path, "unlink target already absent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 读取元数据（不跟随符号链接）；目标不存在时返回 `None`。
    pub async fn stat(
        &self,
        client_id: &str,
        path: &Path,
    ) -> Result<Option<Metadata>, FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        match fs::symlink_metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// 列出目录项名称；目录不存在时返回空列表。
    pub async fn read_dir(&self, client_id: &str, dir: &Path) -> Result<Vec<String>, FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "skipping non utf-8 directory entry"),
            }
        }
        Ok(names)
    }

    pub async fn read_file(&self, client_id: &str, path: &Path) -> Result<Vec<u8>, FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        Ok(fs::read(path).await?)
    }

    pub async fn mkdir(&self, client_id: &str, path: &Path) -> Result<(), FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        Ok(fs::create_dir_all(path).await?)
    }

    /// 将暂存的分片重命名为最终文件。
    pub async fn rename(
        &self,
        client_id: &str,
        from: &Path,
        to: &Path,
    ) -> Result<(), FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        Ok(promote(from, to).await?)
    }

    pub async fn access(&self, client_id: &str, path: &Path) -> Result<(), FileOpError> {
        let _admission = self.gate.acquire(client_id)?;
        fs::metadata(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::ThrottleConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn ops() -> SafeFileOps {
        SafeFileOps::new(Arc::new(ThrottleGate::new(ThrottleConfig::default())))
    }

    #[tokio::test]
    async fn unlink_missing_file_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let target = temp.path().join("gone.pdf");
        for _ in 0..3 {
            ops.unlink("client", &target).await.expect("unlink succeeds");
        }
        assert_eq!(ops.gate().in_flight("client"), 0);
    }

    #[tokio::test]
    async fn unlink_removes_existing_file() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let target = temp.path().join("receipt.pdf");
        std::fs::write(&target, b"%PDF").expect("write");
        ops.unlink("client", &target).await.expect("unlink");
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn stat_reports_absent_instead_of_error() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let missing = ops
            .stat("client", &temp.path().join("nope.png"))
            .await
            .expect("stat");
        assert!(missing.is_none());

        let present = temp.path().join("car.png");
        std::fs::write(&present, b"png").expect("write");
        let metadata = ops.stat("client", &present).await.expect("stat");
        assert_eq!(metadata.map(|m| m.len()), Some(3));
    }

    #[tokio::test]
    async fn read_dir_of_missing_directory_is_empty() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let names = ops
            .read_dir("client", &temp.path().join("missing"))
            .await
            .expect("read_dir");
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn pass_through_primitives_propagate_not_found() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let missing = temp.path().join("missing.pdf");
        let read = ops.read_file("client", &missing).await;
        assert!(
            matches!(read, Err(FileOpError::Io(ref err)) if err.kind() == ErrorKind::NotFound)
        );
        let access = ops.access("client", &missing).await;
        assert!(
            matches!(access, Err(FileOpError::Io(ref err)) if err.kind() == ErrorKind::NotFound)
        );

        let nested = temp.path().join("a").join("b");
        ops.mkdir("client", &nested).await.expect("mkdir");
        ops.access("client", &nested).await.expect("access");
    }

    #[tokio::test]
    async fn failed_operation_still_releases_its_slot() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let missing = temp.path().join("missing.pdf");
        for _ in 0..10 {
            assert!(ops.read_file("client", &missing).await.is_err());
        }
        assert_eq!(ops.gate().in_flight("client"), 0);
        assert_eq!(ops.gate().ops_in_window("client"), 10);
    }

    #[tokio::test]
    async fn rename_moves_staged_file_into_place() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let staged = temp.path().join(".brakes.jpg.part.1");
        let target = temp.path().join("brakes.jpg");
        std::fs::write(&staged, b"jpg").expect("write");
        ops.rename("client", &staged, &target).await.expect("rename");
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&target).expect("read"), b"jpg");
    }

    #[tokio::test]
    async fn primitives_refuse_a_client_at_its_concurrency_cap() {
        let temp = tempdir().expect("tempdir");
        let ops = ops();
        let path = temp.path().join("x.pdf");
        let held: Vec<_> = (0..5)
            .map(|_| ops.gate().acquire("client").expect("admission"))
            .collect();

        let denied = ops.stat("client", &path).await;
        assert!(matches!(
            denied,
            Err(FileOpError::Throttled(Denial::ConcurrencyLimitExceeded))
        ));
        ops.stat("other", &path).await.expect("other client unaffected");

        drop(held);
        ops.stat("client", &path).await.expect("admitted after release");
    }

    #[tokio::test]
    async fn primitives_surface_throttling() {
        let temp = tempdir().expect("tempdir");
        let ops = SafeFileOps::new(Arc::new(ThrottleGate::new(ThrottleConfig {
            window: Duration::from_secs(60),
            max_ops_per_window: 2,
            max_concurrent: 5,
        })));
        let path = temp.path().join("x.pdf");
        ops.stat("client", &path).await.expect("first");
        ops.stat("client", &path).await.expect("second");
        let third = ops.unlink("client", &path).await;
        assert!(matches!(
            third,
            Err(FileOpError::Throttled(Denial::RateLimitExceeded { .. }))
        ));
    }
}
