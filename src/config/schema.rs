//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request body pipe sizing.
    pub pipe: PipeConfig,

    /// Upstream connection pool limits.
    pub pool: PoolConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Content-coding settings.
    pub compression: CompressionConfig,

    /// CORS answers for OPTIONS and cross-origin responses.
    pub cors: CorsConfig,

    /// Blocking worker pool.
    pub workers: WorkerConfig,

    /// Upstream redirect following.
    pub redirects: RedirectConfig,

    /// Upstream authentication.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Origin routes: which upstream answers which Host.
    pub routes: Vec<RouteConfig>,

    /// Destinations reached through an HTTP proxy.
    pub proxies: Vec<ProxyRouteConfig>,

    /// Credentials offered to upstream challenges.
    pub credentials: Vec<CredentialConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Maximum exchanges read ahead on one connection.
    pub max_pipelined: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_pipelined: 16,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to receive a request head.
    pub headers_secs: u64,

    /// Time from request head to final response.
    pub exchange_secs: u64,

    /// Upstream connect timeout.
    pub connect_secs: u64,

    /// Idle keep-alive connection timeout.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            headers_secs: 10,
            exchange_secs: 30,
            connect_secs: 5,
            idle_secs: 60,
        }
    }
}

/// Request body pipe.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Buffered bytes before the connection stops reading.
    pub capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
        }
    }
}

/// Upstream connection pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent requests per destination.
    pub max_per_route: usize,

    /// Concurrent requests across destinations.
    pub max_total: usize,

    /// Idle pooled connection lifetime.
    pub idle_secs: u64,

    /// How long to wait for a free slot before failing with 504.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_route: 20,
            max_total: 200,
            idle_secs: 90,
            acquire_timeout_secs: 10,
        }
    }
}

/// Response cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entries kept per destination.
    pub max_entries: usize,

    /// Largest body stored.
    pub max_entry_bytes: usize,

    /// Bodies above this size go to a blob file when `directory` is set.
    pub memory_threshold_bytes: usize,

    /// Directory for blob files.
    pub directory: Option<String>,

    /// Requests between compaction passes.
    pub clean_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            max_entry_bytes: 1024 * 1024,
            memory_threshold_bytes: 64 * 1024,
            directory: None,
            clean_interval: 100,
        }
    }
}

/// Content coding.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress responses for clients accepting gzip.
    pub enabled: bool,

    /// Bodies must exceed this size (by Content-Length) to be compressed.
    pub min_size: usize,

    /// gzip level, 0-9.
    pub level: u32,

    /// Gunzip request bodies before dispatch.
    pub decode_requests: bool,

    /// Media type patterns; `*` matches a prefix or suffix.
    pub compressible: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 500,
            level: 6,
            decode_requests: true,
            compressible: vec![
                "text/*".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "application/xml".to_string(),
                "*+json".to_string(),
                "*+xml".to_string(),
                "image/svg+xml".to_string(),
            ],
        }
    }
}

/// Cross-origin settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// `*`, empty (disabled) or a comma-separated origin list.
    pub allow_origin: String,

    /// Request headers allowed on preflight.
    pub allow_headers: Vec<String>,

    /// Preflight cache lifetime.
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_headers: vec![
                "Authorization".to_string(),
                "Content-Type".to_string(),
                "If-Match".to_string(),
                "If-None-Match".to_string(),
            ],
            max_age_secs: 600,
        }
    }
}

/// Blocking worker pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Blocking handlers running at once; further submissions are rejected.
    pub max_blocking: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_blocking: 64 }
    }
}

/// Upstream redirects.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Follow redirects instead of passing them to the client.
    pub follow: bool,

    /// Hops before failing.
    pub max_hops: usize,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            follow: false,
            max_hops: 10,
        }
    }
}

/// Upstream authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Largest request body buffered so it can be replayed after a challenge.
    pub replay_limit: usize,

    /// Scheme preference, strongest first.
    pub preference: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_limit: 64 * 1024,
            preference: vec![
                "digest".to_string(),
                "bearer".to_string(),
                "basic".to_string(),
            ],
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset.
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Maps a Host to the origin that serves it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Host header to match (exact, case-insensitive); `*` matches any.
    pub host: String,

    /// Origin base URL, e.g. "http://127.0.0.1:3000".
    pub origin: String,
}

/// Sends traffic for one destination through an HTTP proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyRouteConfig {
    /// Destination `host[:port]`; the port defaults per scheme.
    pub destination: String,

    /// Proxy URL, e.g. "http://proxy.internal:3128".
    pub via: String,
}

/// Credentials for upstream challenges.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialConfig {
    /// Host the credentials apply to; absent matches any.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub realm: Option<String>,

    /// Restrict to one scheme.
    #[serde(default)]
    pub scheme: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Bearer token, used instead of username/password.
    #[serde(default)]
    pub token: Option<String>,

    /// Credentials for a proxy rather than an origin.
    #[serde(default)]
    pub proxy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.cache.clean_interval, 100);
        assert_eq!(config.compression.min_size, 500);
        assert_eq!(config.redirects.max_hops, 10);
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "127.0.0.1:8081"

            [cache]
            max_entries = 5
            directory = "/tmp/cache"

            [[routes]]
            host = "api.local"
            origin = "http://127.0.0.1:3000"

            [[proxies]]
            destination = "partner.example:443"
            via = "http://proxy.internal:3128"

            [[credentials]]
            host = "api.local"
            username = "svc"
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8081");
        assert_eq!(config.listener.max_connections, 10_000);
        assert_eq!(config.cache.max_entries, 5);
        assert!(config.cache.enabled);
        assert_eq!(config.routes[0].origin, "http://127.0.0.1:3000");
        assert_eq!(config.proxies[0].via, "http://proxy.internal:3128");
        assert!(!config.credentials[0].proxy);
    }
}
