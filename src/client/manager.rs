//! Process-wide upstream state: connection pool, per-destination caches and
//! the proxy-override table.
//!
//! # Responsibilities
//! - Own the request-slot pool shared by every upstream chain
//! - Hand out one [`CacheStore`] per destination
//! - Count requests and report when a compaction pass is due
//! - Pick the exec chain for a destination: proxied or default
//! - Close everything explicitly on shutdown
//!
//! # Design Decisions
//! - Compaction cadence uses one atomic counter; exactly one caller sees
//!   each multiple of the interval
//! - The proxy table is a `DashMap` so lookups race safely with updates
//! - The default chain sits in an `ArcSwap` and can be replaced at runtime

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::http::Uri;
use dashmap::DashMap;

use crate::auth::{
    AuthSchemeRegistry, AuthScope, AuthStage, Authenticator, Credentials, InMemoryCredentials,
};
use crate::cache::CacheStore;
use crate::chain::Pipeline;
use crate::client::pool::ConnectionPool;
use crate::client::proxy::ProxyConnector;
use crate::client::redirect::RedirectStage;
use crate::client::transport::{direct_connector, Transport};
use crate::config::{CacheConfig, CredentialConfig, ServerConfig};
use crate::exchange::HttpHost;
use crate::observability::metrics;

/// Upstream chain settings taken from the server configuration.
#[derive(Debug, Clone)]
struct ChainSettings {
    connect_timeout: Duration,
    idle_timeout: Duration,
    follow_redirects: bool,
    max_hops: usize,
    replay_limit: usize,
}

pub struct ConnectionManager {
    settings: ChainSettings,
    cache_config: CacheConfig,
    pool: Arc<ConnectionPool>,
    caches: DashMap<String, Arc<CacheStore>>,
    requests: AtomicU64,
    compactions: AtomicU64,
    target_auth: Arc<Authenticator>,
    proxy_auth: Arc<Authenticator>,
    proxies: DashMap<String, Arc<Pipeline>>,
    default_chain: ArcSwap<Pipeline>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("caches", &self.caches.len())
            .field("proxies", &self.proxies.len())
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn credentials_from(config: &CredentialConfig) -> Option<(AuthScope, Credentials)> {
    let credentials = match (&config.username, &config.password, &config.token) {
        (Some(user), Some(pass), _) => Credentials::basic(user.clone(), pass.clone()),
        (_, _, Some(token)) => Credentials::token(token.clone()),
        _ => return None,
    };
    let mut scope = AuthScope {
        host: config.host.as_ref().map(|h| h.to_ascii_lowercase()),
        port: config.port,
        realm: config.realm.clone(),
        scheme: None,
    };
    if let Some(scheme) = &config.scheme {
        scope = scope.with_scheme(scheme.clone());
    }
    Some((scope, credentials))
}

fn authenticators(config: &ServerConfig) -> (Arc<Authenticator>, Arc<Authenticator>) {
    let target = InMemoryCredentials::new();
    let proxy = InMemoryCredentials::new();
    for entry in &config.credentials {
        let Some((scope, credentials)) = credentials_from(entry) else {
            continue;
        };
        if entry.proxy {
            proxy.set(scope, credentials);
        } else {
            target.set(scope, credentials);
        }
    }
    let registry = AuthSchemeRegistry::default().with_preference(&config.auth.preference);
    (
        Arc::new(Authenticator::new(registry.clone(), Arc::new(target))),
        Arc::new(Authenticator::new(registry, Arc::new(proxy))),
    )
}

impl ConnectionManager {
    pub fn new(config: &ServerConfig) -> Self {
        let settings = ChainSettings {
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            idle_timeout: Duration::from_secs(config.pool.idle_secs),
            follow_redirects: config.redirects.follow,
            max_hops: config.redirects.max_hops,
            replay_limit: config.auth.replay_limit,
        };
        let pool = Arc::new(ConnectionPool::new(&config.pool));
        let (target_auth, proxy_auth) = authenticators(config);
        let default_chain = Self::build_chain(&settings, &pool, &target_auth, None);

        let manager = Self {
            settings,
            cache_config: config.cache.clone(),
            pool,
            caches: DashMap::new(),
            requests: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            target_auth,
            proxy_auth,
            proxies: DashMap::new(),
            default_chain: ArcSwap::from_pointee(default_chain),
            closed: AtomicBool::new(false),
        };

        for route in &config.proxies {
            let via = route.via.parse::<Uri>().ok().and_then(|uri| HttpHost::from_uri(&uri));
            let destination = HttpHost::from_authority("http", &route.destination);
            match (destination, via) {
                (Some(destination), Some(via)) => manager.set_proxy(&destination, &via),
                _ => tracing::warn!(
                    destination = %route.destination,
                    via = %route.via,
                    "Ignoring unparseable proxy route"
                ),
            }
        }
        manager
    }

    fn build_chain(
        settings: &ChainSettings,
        pool: &Arc<ConnectionPool>,
        target_auth: &Arc<Authenticator>,
        proxy: Option<(HttpHost, Arc<Authenticator>)>,
    ) -> Pipeline {
        let connector = direct_connector(settings.connect_timeout);
        let mut auth = AuthStage::new(target_auth.clone(), settings.replay_limit);
        let mut builder = match proxy {
            Some((via, proxy_auth)) => {
                let proxy_uri = format!("http://{}", via.key())
                    .parse::<Uri>()
                    .unwrap_or_else(|_| Uri::from_static("http://127.0.0.1"));
                auth = auth.via_proxy(via, proxy_auth);
                Pipeline::builder(Arc::new(Transport::new(
                    ProxyConnector::new(connector, proxy_uri),
                    pool.clone(),
                    settings.idle_timeout,
                )))
            }
            None => Pipeline::builder(Arc::new(Transport::new(
                connector,
                pool.clone(),
                settings.idle_timeout,
            ))),
        };
        if settings.follow_redirects {
            builder = builder.stage(RedirectStage::new(settings.max_hops));
        }
        builder.stage(auth).build()
    }

    /// Connection slots shared by every upstream chain.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The cache for one destination, created on first use.
    pub fn cache_for(&self, target: &HttpHost) -> Arc<CacheStore> {
        self.caches
            .entry(target.key())
            .or_insert_with(|| {
                let name = format!("{}_{}", target.host, target.port);
                Arc::new(CacheStore::new(&name, &self.cache_config))
            })
            .clone()
    }

    /// Count one request. True exactly once per `clean_interval` requests.
    pub fn record_request(&self) -> bool {
        let interval = self.cache_config.clean_interval.max(1);
        let n = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        n % interval == 0
    }

    /// Compact every cache store. Returns the number of entries removed.
    pub fn clean_resources(&self) -> usize {
        let stores: Vec<Arc<CacheStore>> = self.caches.iter().map(|e| e.value().clone()).collect();
        let removed: usize = stores.iter().map(|s| s.clean()).sum();
        self.compactions.fetch_add(1, Ordering::AcqRel);
        metrics::record_cache_compaction(removed);
        tracing::debug!(stores = stores.len(), removed, "Cache compaction pass");
        removed
    }

    /// Compaction passes run so far.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Acquire)
    }

    /// Requests counted so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    /// Route `destination` through the HTTP proxy at `via`.
    pub fn set_proxy(&self, destination: &HttpHost, via: &HttpHost) {
        let chain = Self::build_chain(
            &self.settings,
            &self.pool,
            &self.target_auth,
            Some((via.clone(), self.proxy_auth.clone())),
        );
        tracing::info!(destination = %destination.key(), via = %via, "Proxy override installed");
        self.proxies.insert(destination.key(), Arc::new(chain));
    }

    pub fn remove_proxy(&self, destination: &HttpHost) -> bool {
        self.proxies.remove(&destination.key()).is_some()
    }

    /// Chain used to reach `target`: its proxy override, else the default.
    pub fn exec_chain_for(&self, target: &HttpHost) -> Arc<Pipeline> {
        if let Some(chain) = self.proxies.get(&target.key()) {
            return chain.clone();
        }
        self.default_chain.load_full()
    }

    /// Replace the default upstream chain.
    pub fn set_default_chain(&self, chain: Pipeline) {
        self.default_chain.store(Arc::new(chain));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pool and every cache store. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        for store in self.caches.iter() {
            store.close();
        }
        self.caches.clear();
        self.proxies.clear();
        tracing::info!("Connection manager shut down");
    }
}
