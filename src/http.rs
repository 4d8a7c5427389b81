//! HTTP 辅助工具：客户端身份识别与安全响应头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::{middleware, response::Response};
use std::net::{IpAddr, SocketAddr};

/// Whether `x-forwarded-for` may override the peer address.
#[derive(Clone, Copy, Debug)]
pub struct ClientIdentityPolicy {
    pub trust_forwarded: bool,
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 计算用于限流的客户端身份字符串。
pub fn client_identity(
    headers: &HeaderMap,
    peer: SocketAddr,
    policy: ClientIdentityPolicy,
) -> String {
    let forwarded = if policy.trust_forwarded {
        extract_forwarded_ip(headers)
    } else {
        None
    };
    forwarded.unwrap_or_else(|| peer.ip()).to_string()
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        axum::http::header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; sandbox"),
    );
    Ok(response)
}
