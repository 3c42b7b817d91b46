//! Client address resolution.
//!
//! `X-Forwarded-For` is honoured only when the socket peer is a configured
//! trusted proxy. Any other caller is identified by its socket address.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Origin address of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Peers allowed to report the client address via `X-Forwarded-For`.
/// Installed into request extensions by the router.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies(Arc<HashSet<IpAddr>>);

impl TrustedProxies {
    pub fn new(proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(Arc::new(proxies.into_iter().collect()))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted: &TrustedProxies,
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer.ip()) {
        return peer.ip().to_string();
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|v| v.parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
        .to_string()
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let trusted = parts
            .extensions
            .get::<TrustedProxies>()
            .cloned()
            .unwrap_or_default();
        Ok(ClientIp(resolve_client_ip(&parts.headers, peer, &trusted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_forwarded_header_from_trusted_proxy() {
        let proxy: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let trusted = TrustedProxies::new([proxy.ip()]);
        let headers = forwarded("203.0.113.7, 10.0.0.2");
        assert_eq!(resolve_client_ip(&headers, Some(proxy), &trusted), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_header_ignored_from_untrusted_peer() {
        let trusted = TrustedProxies::new(["10.0.0.2".parse::<IpAddr>().unwrap()]);
        let peer: SocketAddr = "198.51.100.20:4000".parse().unwrap();
        let headers = forwarded("203.0.113.7");
        assert_eq!(resolve_client_ip(&headers, Some(peer), &trusted), "198.51.100.20");
        assert_eq!(
            resolve_client_ip(&headers, Some(peer), &TrustedProxies::default()),
            "198.51.100.20"
        );
    }

    #[test]
    fn test_garbage_forwarded_value_uses_proxy_address() {
        let proxy: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let trusted = TrustedProxies::new([proxy.ip()]);
        let headers = forwarded("not-an-address");
        assert_eq!(resolve_client_ip(&headers, Some(proxy), &trusted), "10.0.0.2");
    }

    #[test]
    fn test_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.9:443".parse().unwrap();
        let trusted = TrustedProxies::default();
        assert_eq!(resolve_client_ip(&headers, Some(peer), &trusted), "192.168.1.9");
        assert_eq!(resolve_client_ip(&headers, None, &trusted), "unknown");
        assert_eq!(resolve_client_ip(&forwarded("203.0.113.7"), None, &trusted), "unknown");
    }
}
