//! 可选的 HTTPS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 同时提供证书与私钥时构建 Rustls 配置，否则返回 `None`。
pub async fn load_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).await?;
            let key = fs::read(key_path).await?;
            info!(cert = %cert_path, "loaded tls certificate");
            RustlsConfig::from_pem(cert, key).await.map(Some)
        }
        (None, None) => Ok(None),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "both --tls-cert and --tls-key are required for https",
        )),
    }
}
