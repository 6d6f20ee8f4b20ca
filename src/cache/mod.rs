//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Caching stage
//!     → key.rs (normalized URI, Vary selection)
//!     → store.rs (per-destination CacheStore, owned by ConnectionManager)
//!     → entry.rs (stored status/headers/body, age and freshness)
//!     → freshness.rs (Cache-Control, lifetime, heuristic, corrected age)
//! ```
//!
//! # Design Decisions
//! - Shared-cache semantics: `private` and authorized responses are not stored
//! - Bodies above a threshold live in file-backed blobs, removed by
//!   compaction or on close; nothing depends on drop order

pub mod entry;
pub mod freshness;
pub mod key;
pub mod store;

pub use entry::{CacheEntry, Freshness, Resource};
pub use freshness::CacheControl;
pub use store::CacheStore;

/// How the cache took part in answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a stored entry without contacting the origin.
    Hit,
    /// Forwarded; the response may have been stored.
    Miss,
    /// A stale entry was confirmed by the origin with 304.
    Validated,
    /// The request or its method bypassed the cache.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Validated => "validated",
            CacheStatus::Bypass => "bypass",
        }
    }
}
