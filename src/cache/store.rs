//! Per-destination response store.
//!
//! # Responsibilities
//! - Hold entries by primary key, one variant per `Vary` selection
//! - Spill large bodies to file-backed blobs when a directory is configured
//! - Compact: drop dead entries, enforce the entry cap, remove orphaned blobs
//! - Close explicitly: clear entries and delete this store's blobs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::http::HeaderMap;
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use crate::cache::entry::{CacheEntry, Resource};
use crate::config::CacheConfig;

/// Response cache for one destination.
#[derive(Debug)]
pub struct CacheStore {
    name: String,
    entries: DashMap<String, Vec<Arc<CacheEntry>>>,
    max_entries: usize,
    max_entry_bytes: usize,
    memory_threshold: usize,
    directory: Option<PathBuf>,
    compactions: AtomicU64,
    closed: AtomicBool,
}

impl CacheStore {
    /// Create a store. `name` prefixes blob files so stores sharing a
    /// directory never touch each other's files.
    pub fn new(name: &str, config: &CacheConfig) -> Self {
        let name = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Self {
            name,
            entries: DashMap::new(),
            max_entries: config.max_entries,
            max_entry_bytes: config.max_entry_bytes,
            memory_threshold: config.memory_threshold_bytes,
            directory: config.directory.as_ref().map(PathBuf::from),
            compactions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    /// Number of stored variants.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many compaction passes ran.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Variant matching the request's `Vary` selection.
    pub fn get(&self, key: &str, request_headers: &HeaderMap) -> Option<Arc<CacheEntry>> {
        if self.is_closed() {
            return None;
        }
        self.entries
            .get(key)?
            .iter()
            .find(|e| e.vary.matches(request_headers))
            .cloned()
    }

    /// Choose where a body of `body` bytes should live.
    pub fn resource_for(&self, body: Bytes) -> io::Result<Resource> {
        match &self.directory {
            Some(dir) if body.len() > self.memory_threshold => {
                fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}-{}.blob", self.name, Uuid::new_v4()));
                fs::write(&path, &body)?;
                Ok(Resource::File {
                    path,
                    len: body.len(),
                })
            }
            _ => Ok(Resource::Memory(body)),
        }
    }

    /// Store an entry, replacing the variant with the same `Vary` selection.
    pub fn put(&self, key: String, entry: CacheEntry) {
        if self.is_closed() || entry.resource.len() > self.max_entry_bytes {
            remove_blob(&entry.resource);
            return;
        }
        let entry = Arc::new(entry);
        let mut variants = self.entries.entry(key).or_default();
        let mut replaced = Vec::new();
        variants.retain(|v| {
            let same = v.vary == entry.vary;
            if same {
                replaced.push(v.clone());
            }
            !same
        });
        variants.push(entry);
        drop(variants);
        for old in replaced {
            release(old);
        }
    }

    /// Drop every variant under `key`.
    pub fn invalidate(&self, key: &str) -> usize {
        match self.entries.remove(key) {
            Some((_, variants)) => {
                let n = variants.len();
                variants.into_iter().for_each(release);
                n
            }
            None => 0,
        }
    }

    /// Compaction pass. Returns how many variants were removed.
    pub fn clean(&self) -> usize {
        self.clean_at(SystemTime::now())
    }

    pub(crate) fn clean_at(&self, now: SystemTime) -> usize {
        let mut removed = 0;

        // Expired entries that cannot be revalidated are dead weight.
        self.entries.retain(|_, variants| {
            variants.retain(|e| {
                let keep = e.is_fresh(now) || e.has_validator();
                if !keep {
                    removed += 1;
                    remove_blob(&e.resource);
                }
                keep
            });
            !variants.is_empty()
        });

        let total = self.len();
        if total > self.max_entries {
            let mut all: Vec<(String, SystemTime, Arc<CacheEntry>)> = self
                .entries
                .iter()
                .flat_map(|kv| {
                    let key = kv.key().clone();
                    kv.value()
                        .iter()
                        .map(move |e| (key.clone(), e.response_time, e.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            all.sort_by_key(|(_, at, _)| *at);
            for (key, _, entry) in all.into_iter().take(total - self.max_entries) {
                if let Some(mut variants) = self.entries.get_mut(&key) {
                    variants.retain(|e| !Arc::ptr_eq(e, &entry));
                }
                release(entry);
                removed += 1;
            }
            self.entries.retain(|_, v| !v.is_empty());
        }

        removed += self.remove_orphans();
        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(store = %self.name, removed, remaining = self.len(), "Cache compacted");
        removed
    }

    fn remove_orphans(&self) -> usize {
        let Some(dir) = &self.directory else {
            return 0;
        };
        let Ok(listing) = fs::read_dir(dir) else {
            return 0;
        };
        let referenced: Vec<PathBuf> = self
            .entries
            .iter()
            .flat_map(|kv| {
                kv.value()
                    .iter()
                    .filter_map(|e| e.resource.path().cloned())
                    .collect::<Vec<_>>()
            })
            .collect();
        let prefix = format!("{}-", self.name);
        let mut removed = 0;
        for file in listing.flatten() {
            let path = file.path();
            if !is_own_blob(&path, &prefix) || referenced.contains(&path) {
                continue;
            }
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Release all entries and blobs. Later `get`/`put` calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<String> = self.entries.iter().map(|kv| kv.key().clone()).collect();
        for key in keys {
            self.invalidate(&key);
        }
        self.remove_orphans();
        tracing::debug!(store = %self.name, "Cache store closed");
    }
}

fn is_own_blob(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(prefix) && n.ends_with(".blob"))
        .unwrap_or(false)
}

/// Delete the blob once no reader holds the entry any more.
fn release(entry: Arc<CacheEntry>) {
    if let Ok(entry) = Arc::try_unwrap(entry) {
        remove_blob(&entry.resource);
    }
}

fn remove_blob(resource: &Resource) {
    if let Some(path) = resource.path() {
        let _ = fs::remove_file(path);
    }
}
