//! Typed per-exchange context and target host.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::http::uri::Scheme;
use axum::http::Uri;
use bytes::Bytes;
use uuid::Uuid;

use crate::auth::AuthState;
use crate::cache::CacheStatus;
use crate::chain::dispatch::{ResourceState, UnitOfWorkHandle};

/// Request line and header block exactly as received, stored as a request
/// extension by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHead(pub Bytes);

/// Destination of a request: scheme, host and a concrete port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpHost {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HttpHost {
    /// Build a host, filling in the scheme's default port when `port` is `None`.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        let scheme = scheme.to_ascii_lowercase();
        let port = port.unwrap_or_else(|| default_port(&scheme));
        Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Extract the target from an absolute URI.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let host = uri.host()?;
        let scheme = uri.scheme().map(Scheme::as_str).unwrap_or("http");
        Some(Self::new(scheme, host, uri.port_u16()))
    }

    /// Parse `host[:port]` as sent in a `Host` header.
    pub fn from_authority(scheme: &str, authority: &str) -> Option<Self> {
        let authority: axum::http::uri::Authority = authority.parse().ok()?;
        Some(Self::new(scheme, authority.host(), authority.port_u16()))
    }

    /// `host:port` key used by per-destination tables.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the port is the scheme default and may be omitted.
    pub fn has_default_port(&self) -> bool {
        self.port == default_port(&self.scheme)
    }

    /// Value for a `Host` header.
    pub fn authority(&self) -> String {
        if self.has_default_port() {
            self.host.clone()
        } else {
            self.key()
        }
    }
}

impl fmt::Display for HttpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Default port for a scheme; unknown schemes fall back to 80.
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

/// Per-exchange state carried through the execution chain.
///
/// Never shared between exchanges; stages take it by `&mut`.
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_addr: Option<SocketAddr>,
    pub received_at: SystemTime,
    pub scheme: String,
    /// Open unit of work, set by the transaction stage.
    pub unit_of_work: Option<UnitOfWorkHandle>,
    /// Domain operation chosen by dispatch. Opaque to the chain.
    pub operation: Option<Arc<dyn Any + Send + Sync>>,
    resource: Option<Option<ResourceState>>,
    pub target_auth: AuthState,
    pub proxy_auth: AuthState,
    pub cache_status: Option<CacheStatus>,
}

impl RequestContext {
    pub fn new(client_addr: Option<SocketAddr>, scheme: &str) -> Self {
        Self {
            client_addr,
            scheme: scheme.to_string(),
            ..Self::default()
        }
    }

    /// Resolved resource state, if resolution already ran.
    pub fn resource(&self) -> Option<&ResourceState> {
        self.resource.as_ref().and_then(Option::as_ref)
    }

    /// Whether resolution already ran, with or without a result.
    pub fn is_resolved(&self) -> bool {
        self.resource.is_some()
    }

    pub fn set_resource(&mut self, resource: Option<ResourceState>) {
        self.resource = Some(resource);
    }

    /// Forget the memoised resource so the next stage resolves again.
    pub fn clear_resource(&mut self) {
        self.resource = None;
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_addr: None,
            received_at: SystemTime::now(),
            scheme: "http".to_string(),
            unit_of_work: None,
            operation: None,
            resource: None,
            target_auth: AuthState::default(),
            proxy_auth: AuthState::default(),
            cache_status: None,
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("client_addr", &self.client_addr)
            .field("scheme", &self.scheme)
            .field("resolved", &self.is_resolved())
            .field("cache_status", &self.cache_status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_normalization() {
        let a = HttpHost::new("http", "Example.com", None);
        let b = HttpHost::from_uri(&"http://example.com:80/x".parse().unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), "example.com:80");
        assert_eq!(a.authority(), "example.com");

        let tls = HttpHost::new("https", "example.com", None);
        assert_eq!(tls.port, 443);
        let odd = HttpHost::from_authority("http", "example.com:8080").unwrap();
        assert_eq!(odd.to_string(), "http://example.com:8080");
    }

    #[test]
    fn test_resource_memoisation() {
        let mut ctx = RequestContext::default();
        assert!(!ctx.is_resolved());
        ctx.set_resource(None);
        assert!(ctx.is_resolved());
        assert!(ctx.resource().is_none());
    }
}
