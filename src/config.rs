//! CLI arguments and service configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_FILENAME_LEN: usize = 255;
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "pdf"];
/// Accepted upload media types and the extension each is stored under.
pub const ALLOWED_MEDIA_TYPES: [(&str, &str); 4] = [
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("application/pdf", "pdf"),
];
pub const UPLOAD_URL_PREFIX: &str = "/uploads";
pub const PARTIAL_UPLOAD_MARKER: &str = ".part.";
pub const MAINTENANCE_CLIENT_ID: &str = "local-maintenance";
pub const DEFAULT_THROTTLE_WINDOW_SECS: u64 = 60;
pub const DEFAULT_THROTTLE_MAX_OPS: u32 = 30;
pub const DEFAULT_THROTTLE_MAX_CONCURRENT: usize = 5;
pub const CONCURRENCY_RETRY_AFTER_SECS: u64 = 1;
pub const DEFAULT_UPLOAD_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_FILES: usize = 10;
pub const DEFAULT_PARTIAL_TTL_SECS: u64 = 60 * 60;
pub const PARTIAL_SWEEP_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the service.
#[derive(Parser, Debug)]
#[command(
    name = "carelog-uploads",
    version = VERSION_INFO,
    about = "Maintenance document upload service"
)]
pub struct Args {
    #[arg(
        short = 'u',
        long,
        env = "CARELOG_UPLOAD_DIR",
        default_value = ".carelog/uploads",
        help = "Directory holding receipts and vehicle photos"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "CARELOG_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CARELOG_HTTP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CARELOG_HTTPS_PORT",
        default_value_t = 3443,
        help = "HTTPS port (used only with a cert and key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "CARELOG_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CARELOG_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "CARELOG_TRUST_FORWARDED",
        default_value_t = false,
        help = "Take the client identity from x-forwarded-for"
    )]
    pub trust_forwarded: bool,
    #[arg(
        long,
        env = "CARELOG_THROTTLE_WINDOW_SECS",
        default_value_t = DEFAULT_THROTTLE_WINDOW_SECS,
        help = "Length of the per-client operation window in seconds"
    )]
    pub throttle_window_secs: u64,
    #[arg(
        long,
        env = "CARELOG_THROTTLE_MAX_OPS",
        default_value_t = DEFAULT_THROTTLE_MAX_OPS,
        help = "Max file operations per client per window"
    )]
    pub throttle_max_ops: u32,
    #[arg(
        long,
        env = "CARELOG_THROTTLE_MAX_CONCURRENT",
        default_value_t = DEFAULT_THROTTLE_MAX_CONCURRENT,
        help = "Max file operations in flight per client"
    )]
    pub throttle_max_concurrent: usize,
    #[arg(
        long,
        env = "CARELOG_UPLOAD_MAX_FILE_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_FILE_SIZE,
        help = "Max size of one uploaded file in bytes"
    )]
    pub upload_max_file_size: u64,
    #[arg(
        long,
        env = "CARELOG_UPLOAD_MAX_FILES",
        default_value_t = DEFAULT_UPLOAD_MAX_FILES,
        help = "Max files accepted in one upload request"
    )]
    pub upload_max_files: usize,
    #[arg(
        long,
        env = "CARELOG_PARTIAL_TTL_SECS",
        default_value_t = DEFAULT_PARTIAL_TTL_SECS,
        help = "Age after which interrupted partial uploads are removed (0 to disable)"
    )]
    pub partial_ttl_secs: u64,
    #[arg(
        long,
        env = "CARELOG_LOG_LEVEL",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_level: String,
}
