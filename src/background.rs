//! 中断上传遗留临时文件的定期清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{MAINTENANCE_CLIENT_ID, PARTIAL_SWEEP_INTERVAL_SECS};
use crate::uploads::UploadOrchestrator;

/// 启动后台清理任务；`ttl` 为零时不启动。
pub fn spawn_background_tasks(orchestrator: Arc<UploadOrchestrator>, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(PARTIAL_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match orchestrator.sweep_partials(MAINTENANCE_CLIENT_ID, ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "partial upload sweep finished"),
                Err(err) => warn!(error = ?err, "partial upload sweep failed"),
            }
        }
    });
}
