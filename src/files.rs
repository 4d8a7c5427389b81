//! 上传、列表、删除与下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Multipart, Path, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, IntakeError};
use crate::config::ALLOWED_MEDIA_TYPES;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::http::{ClientIdentityPolicy, client_identity};
use crate::sanitize::resolve_safe_path;
use crate::uploads::{
    ReceivedFile, RejectedUpload, RejectionKind, StoreOutcome, StoredFile, UploadError,
    UploadOrchestrator, mime_for,
};

#[derive(Debug, Clone, Copy)]
pub struct IntakeConfig {
    pub max_file_size: u64,
    pub max_files: usize,
}

/// 接收 multipart 上传，暂存后交由编排器校验并转正。
pub async fn upload_files(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Extension(intake): Extension<IntakeConfig>,
    Extension(policy): Extension<ClientIdentityPolicy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<StoreOutcome>), ApiError> {
    let client = client_identity(&headers, peer, policy);
    orchestrator.prepare(&client).await?;

    let mut received = Vec::new();
    let mut refused = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                abandon(&orchestrator, &client, &received).await;
                return Err(ApiError::BadRequest(err.body_text()));
            }
        };
        if field.file_name().is_none() {
            continue;
        }
        if received.len() + refused.len() >= intake.max_files {
            abandon(&orchestrator, &client, &received).await;
            return Err(ApiError::BadRequest("too many files in one request".into()));
        }
        match receive_field(orchestrator.base_dir(), field, &intake).await {
            Ok(Ok(file)) => received.push(file),
            Ok(Err(rejection)) => refused.push(rejection),
            Err(err) => {
                abandon(&orchestrator, &client, &received).await;
                return Err(err);
            }
        }
    }

    if received.is_empty() && refused.is_empty() {
        return Err(ApiError::BadRequest("no files uploaded".into()));
    }

    let mut outcome = orchestrator.store_files(&client, received).await?;
    outcome.rejected.extend(refused);
    info!(
        client,
        in_flight = orchestrator.ops().gate().in_flight(&client),
        stored = outcome.stored.len(),
        rejected = outcome.rejected.len(),
        "upload request processed"
    );
    let status = if outcome.stored.is_empty() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::CREATED
    };
    Ok((status, JsonResponse(outcome)))
}

/// Stages one multipart file part under a hidden partial name.
///
/// Parts with a disallowed media type or over the size limit come back as
/// `Ok(Err(_))` and leave nothing on disk.
async fn receive_field(
    base_dir: &FsPath,
    mut field: Field<'_>,
    intake: &IntakeConfig,
) -> Result<Result<ReceivedFile, RejectedUpload>, ApiError> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let mime_type = field
        .content_type()
        .map(media_type_essence)
        .unwrap_or_else(|| mime_for(&original_name));
    let Some(extension) = extension_for(&mime_type) else {
        debug!(original_name, mime_type, "refused upload media type");
        return Ok(Err(RejectedUpload {
            original_name,
            file_name: None,
            kind: RejectionKind::UnsupportedMediaType,
            reason: format!("media type {mime_type} is not allowed"),
        }));
    };

    let file_name = assigned_file_name(extension);
    let target = resolve_safe_path(&file_name, base_dir).map_err(UploadError::from)?;
    let mut partial = AtomicFile::create(target.as_path(), intake.max_file_size)
        .await
        .map_err(UploadError::Io)?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                partial.discard().await;
                return Err(ApiError::BadRequest(err.body_text()));
            }
        };
        match partial.write_chunk(&chunk).await {
            Ok(()) => {}
            Err(IntakeError::TooLarge) => {
                partial.discard().await;
                return Ok(Err(RejectedUpload {
                    original_name,
                    file_name: Some(file_name),
                    kind: RejectionKind::FileTooLarge,
                    reason: format!("file exceeds {} bytes", intake.max_file_size),
                }));
            }
            Err(IntakeError::Io(err)) => {
                partial.discard().await;
                return Err(UploadError::Io(err).into());
            }
        }
    }

    let staged = partial.finish().await.map_err(UploadError::Io)?;
    Ok(Ok(ReceivedFile {
        path: staged.path,
        file_name,
        original_name,
        mime_type,
        size: staged.size,
    }))
}

/// Removes files written earlier in a request that is being aborted.
async fn abandon(orchestrator: &UploadOrchestrator, client: &str, received: &[ReceivedFile]) {
    for file in received {
        if let Err(err) = orchestrator.ops().unlink(client, &file.path).await {
            warn!(client, path = ?file.path, error = ?err, "failed to remove abandoned upload");
        }
    }
}

/// `type/subtype` without parameters, lowercased.
fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// 允许的媒体类型对应的存储扩展名。
fn extension_for(media_type: &str) -> Option<&'static str> {
    ALLOWED_MEDIA_TYPES
        .iter()
        .find(|(allowed, _)| *allowed == media_type)
        .map(|(_, extension)| *extension)
}

/// 生成落盘文件名：随机 UUID 加上由媒体类型决定的扩展名。
pub fn assigned_file_name(extension: &str) -> String {
    format!("{}.{extension}", Uuid::new_v4().simple())
}

/// 列出上传目录中的文件。
pub async fn list_uploads(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Extension(policy): Extension<ClientIdentityPolicy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<JsonResponse<Vec<StoredFile>>, ApiError> {
    let client = client_identity(&headers, peer, policy);
    let files = orchestrator.list_files(&client).await?;
    debug!(
        client,
        count = files.len(),
        ops_in_window = orchestrator.ops().gate().ops_in_window(&client),
        "list uploads"
    );
    Ok(JsonResponse(files))
}

/// 删除单个上传文件。
pub async fn delete_upload(
    Path(file_name): Path<String>,
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Extension(policy): Extension<ClientIdentityPolicy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let client = client_identity(&headers, peer, policy);
    orchestrator.delete_file(&client, &file_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 下载上传文件，支持 `If-None-Match`。
pub async fn download_upload(
    Path(file_name): Path<String>,
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Extension(policy): Extension<ClientIdentityPolicy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let client = client_identity(&request_headers, peer, policy);
    let (contents, metadata) = orchestrator.read_file(&client, &file_name).await?;

    let etag = etag_from_metadata(&metadata);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("invalid etag".into()))?,
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if is_not_modified(&request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime_for(&file_name))
            .map_err(|_| ApiError::Internal("invalid content type".into()))?,
    );
    Ok((headers, AxumBody::from(contents)).into_response())
}
