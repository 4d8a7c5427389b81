//! 版本与运行参数信息处理器。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ALLOWED_EXTENSIONS, MAX_FILENAME_LEN};
use crate::error::ApiError;
use crate::uploads::UploadOrchestrator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    limits: LimitsInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsInfo {
    window_secs: u64,
    max_ops_per_window: u32,
    max_concurrent: usize,
    max_filename_len: usize,
    allowed_extensions: &'static [&'static str],
}

/// 返回当前版本信息与生效的限流参数。
pub async fn get_version_info(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
) -> Result<JsonResponse<VersionInfo>, ApiError> {
    let throttle = orchestrator.ops().gate().config();
    let version_info = VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        limits: LimitsInfo {
            window_secs: throttle.window.as_secs(),
            max_ops_per_window: throttle.max_ops_per_window,
            max_concurrent: throttle.max_concurrent,
            max_filename_len: MAX_FILENAME_LEN,
            allowed_extensions: &ALLOWED_EXTENSIONS,
        },
    };
    Ok(JsonResponse(version_info))
}
