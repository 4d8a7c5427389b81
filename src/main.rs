//! Carelog upload service binary.
//!
//! Serves the maintenance-document API of the vehicle record keeper: uploads
//! of receipts and vehicle photos, listing, download and deletion. Every
//! filesystem operation on the upload directory runs through a per-client
//! throttle gate, and every filename passes the sanitizer before it touches
//! disk.

mod atomic;
mod background;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod logging;
mod safe_fs;
mod sanitize;
mod throttle;
mod tls;
mod uploads;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, MAINTENANCE_CLIENT_ID, UPLOAD_URL_PREFIX};
use crate::files::IntakeConfig;
use crate::http::ClientIdentityPolicy;
use crate::safe_fs::SafeFileOps;
use crate::throttle::{ThrottleConfig, ThrottleGate};
use crate::uploads::UploadOrchestrator;

shadow!(build);

/// Multipart framing overhead allowed on top of the file payloads.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Starts the upload service and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let gate = Arc::new(ThrottleGate::new(ThrottleConfig {
        window: Duration::from_secs(args.throttle_window_secs),
        max_ops_per_window: args.throttle_max_ops,
        max_concurrent: args.throttle_max_concurrent,
    }));
    let orchestrator = Arc::new(UploadOrchestrator::new(
        PathBuf::from(&args.upload_dir),
        SafeFileOps::new(gate),
    ));
    orchestrator
        .prepare(MAINTENANCE_CLIENT_ID)
        .await
        .map_err(|err| std::io::Error::other(format!("upload directory unavailable: {err:?}")))?;

    let intake = IntakeConfig {
        max_file_size: args.upload_max_file_size,
        max_files: args.upload_max_files,
    };
    let policy = ClientIdentityPolicy {
        trust_forwarded: args.trust_forwarded,
    };
    let body_limit = args
        .upload_max_file_size
        .saturating_mul(args.upload_max_files as u64)
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let app = Router::new()
        .route(
            "/api/uploads",
            get(files::list_uploads)
                .post(files::upload_files)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/uploads/{file_name}", delete(files::delete_upload))
        .route(
            &format!("{UPLOAD_URL_PREFIX}/{{file_name}}"),
            get(files::download_upload),
        )
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| {
                            http::client_identity(request.headers(), *addr, policy)
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(orchestrator.clone()))
        .layer(Extension(intake))
        .layer(Extension(policy));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    info!(dir = %args.upload_dir, "serving uploads");
    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    spawn_background_tasks(orchestrator, Duration::from_secs(args.partial_ttl_secs));

    match tls_config {
        Some(tls_config) => {
            let https_addr = SocketAddr::new(host, args.https_port);
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
