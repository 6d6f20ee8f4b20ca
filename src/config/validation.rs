//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses and URLs parse)
//! - Check credentials are complete
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::ServerConfig;

/// One semantic problem, with the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: String, value: &str) {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
        Ok(_) => errors.push(ValidationError::new(field, "must be an http(s) URL with a host")),
        Err(e) => errors.push(ValidationError::new(field, format!("invalid URL: {}", e))),
    }
}

/// Check a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            "must be a socket address",
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if config.listener.max_pipelined == 0 {
        errors.push(ValidationError::new("listener.max_pipelined", "must be > 0"));
    }
    for (field, value) in [
        ("timeouts.headers_secs", config.timeouts.headers_secs),
        ("timeouts.exchange_secs", config.timeouts.exchange_secs),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }
    if config.pipe.capacity == 0 {
        errors.push(ValidationError::new("pipe.capacity", "must be > 0"));
    }
    if config.pool.max_per_route == 0 || config.pool.max_total == 0 {
        errors.push(ValidationError::new("pool", "limits must be > 0"));
    } else if config.pool.max_per_route > config.pool.max_total {
        errors.push(ValidationError::new(
            "pool.max_per_route",
            "must not exceed pool.max_total",
        ));
    }
    if config.cache.clean_interval == 0 {
        errors.push(ValidationError::new("cache.clean_interval", "must be > 0"));
    }
    if config.compression.level > 9 {
        errors.push(ValidationError::new("compression.level", "must be 0-9"));
    }
    if config.workers.max_blocking == 0 {
        errors.push(ValidationError::new("workers.max_blocking", "must be > 0"));
    }
    if config.redirects.follow && config.redirects.max_hops == 0 {
        errors.push(ValidationError::new("redirects.max_hops", "must be > 0 when following"));
    }
    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    for (i, route) in config.routes.iter().enumerate() {
        if route.host.trim().is_empty() {
            errors.push(ValidationError::new(format!("routes[{}].host", i), "must not be empty"));
        }
        check_url(&mut errors, format!("routes[{}].origin", i), &route.origin);
    }
    for (i, proxy) in config.proxies.iter().enumerate() {
        if proxy.destination.parse::<axum::http::uri::Authority>().is_err() {
            errors.push(ValidationError::new(
                format!("proxies[{}].destination", i),
                "must be host[:port]",
            ));
        }
        check_url(&mut errors, format!("proxies[{}].via", i), &proxy.via);
    }
    for (i, cred) in config.credentials.iter().enumerate() {
        let field = format!("credentials[{}]", i);
        match (&cred.username, &cred.password, &cred.token) {
            (Some(_), Some(_), None) | (None, None, Some(_)) => {}
            _ => errors.push(ValidationError::new(
                field,
                "needs either username and password, or token",
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
