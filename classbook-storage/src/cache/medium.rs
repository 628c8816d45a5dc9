//! Key/value cache medium trait and in-memory implementation.
//!
//! A medium is a dumb byte store with a hard per-entry size ceiling and
//! per-entry TTL. Entries may disappear independently of each other at any
//! time; [`super::ChunkedCacheStore`] is written to tolerate that.

use async_trait::async_trait;
use classbook_core::{CacheError, ClassbookResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Pluggable cache medium.
///
/// Implementations must be thread-safe and reject values larger than
/// [`CacheMedium::max_entry_bytes`] with [`CacheError::EntryTooLarge`].
#[async_trait]
pub trait CacheMedium: Send + Sync {
    /// Get a live entry, or `None` if absent or expired.
    async fn get(&self, key: &str) -> ClassbookResult<Option<Vec<u8>>>;

    /// Store an entry that expires after `ttl`.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> ClassbookResult<()>;

    /// Remove an entry. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> ClassbookResult<()>;

    /// Hard per-entry size ceiling in bytes.
    fn max_entry_bytes(&self) -> usize;

    /// Usage statistics.
    async fn stats(&self) -> ClassbookResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    /// Approximate payload bytes currently stored.
    pub memory_bytes: u64,
    /// Entries dropped by expiry or explicit eviction.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub(crate) fn check_ceiling(key: &str, size_bytes: usize, ceiling_bytes: usize) -> ClassbookResult<()> {
    if size_bytes > ceiling_bytes {
        return Err(CacheError::EntryTooLarge {
            key: key.to_string(),
            size_bytes,
            ceiling_bytes,
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// IN-MEMORY MEDIUM
// ============================================================================

#[derive(Debug)]
struct StoredEntry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Process-local medium backed by a `HashMap`.
#[derive(Debug)]
pub struct InMemoryCacheMedium {
    entries: RwLock<HashMap<String, StoredEntry>>,
    ceiling_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryCacheMedium {
    pub fn new(ceiling_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ceiling_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Drop an entry as if the medium had evicted it on its own.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self
            .entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Keys currently stored, expired or not, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Overwrite an entry without any checks, for corrupting entries in tests.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.to_string(),
                StoredEntry {
                    bytes,
                    expires_at: Instant::now() + Duration::from_secs(3600),
                },
            );
        }
    }

    fn backend_error(reason: &str) -> classbook_core::ClassbookError {
        CacheError::Backend {
            reason: reason.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl CacheMedium for InMemoryCacheMedium {
    async fn get(&self, key: &str) -> ClassbookResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let found = {
            let entries = self
                .entries
                .read()
                .map_err(|_| Self::backend_error("entry map poisoned"))?;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => Some(Some(entry.bytes.clone())),
                Some(_) => Some(None),
                None => None,
            }
        };

        match found {
            Some(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bytes))
            }
            Some(None) => {
                // Expired: drop it so stats reflect the eviction.
                self.evict(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> ClassbookResult<()> {
        check_ceiling(key, value.len(), self.ceiling_bytes)?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Self::backend_error("entry map poisoned"))?;
        entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClassbookResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Self::backend_error("entry map poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    fn max_entry_bytes(&self) -> usize {
        self.ceiling_bytes
    }

    async fn stats(&self) -> ClassbookResult<CacheStats> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Self::backend_error("entry map poisoned"))?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            memory_bytes: entries.values().map(|e| e.bytes.len() as u64).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
