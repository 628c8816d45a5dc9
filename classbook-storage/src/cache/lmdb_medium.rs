//! LMDB-backed cache medium.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped,
//! persistent key-value store that survives process restarts.
//!
//! # Value Format
//!
//! `[expires_at millis: 8 bytes LE][payload]`. Expired entries read as absent
//! and are removed on the next write transaction that touches them.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use classbook_core::{CacheError, ClassbookError, ClassbookResult};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::medium::{check_ceiling, CacheMedium, CacheStats};

const EXPIRY_PREFIX_LEN: usize = 8;

/// Error type for LMDB medium operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for ClassbookError {
    fn from(e: LmdbCacheError) -> Self {
        ClassbookError::Cache(CacheError::Backend {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

/// LMDB-backed cache medium.
///
/// # Example
///
/// ```ignore
/// let medium = LmdbCacheMedium::new("/var/cache/classbook", 64, 100 * 1024)?;
/// let store = ChunkedCacheStore::new(Arc::new(medium), &config);
/// ```
pub struct LmdbCacheMedium {
    env: Env,
    db: Database<Bytes, Bytes>,
    ceiling_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LmdbCacheMedium {
    /// Open (or create) an LMDB medium.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    /// * `ceiling_bytes` - Per-entry size ceiling enforced on `put`
    pub fn new<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        ceiling_bytes: usize,
    ) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this process
        // and never concurrently re-opened with different options.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            ceiling_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn remove_expired(&self, key: &str) -> Result<(), LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let now = Utc::now().timestamp_millis();
        let expired = match self.db.get(&wtxn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode_expiry(bytes).map_or(true, |expires_at| expires_at <= now),
            None => false,
        };
        if expired && self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)? {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }
}

fn decode_expiry(bytes: &[u8]) -> Option<i64> {
    let prefix: [u8; EXPIRY_PREFIX_LEN] = bytes.get(..EXPIRY_PREFIX_LEN)?.try_into().ok()?;
    Some(i64::from_le_bytes(prefix))
}

#[async_trait]
impl CacheMedium for LmdbCacheMedium {
    async fn get(&self, key: &str) -> ClassbookResult<Option<Vec<u8>>> {
        let now = Utc::now().timestamp_millis();
        let live = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            match self.db.get(&rtxn, key.as_bytes()).map_err(txn_err)? {
                Some(bytes) => match decode_expiry(bytes) {
                    Some(expires_at) if expires_at > now => {
                        Some(Some(bytes[EXPIRY_PREFIX_LEN..].to_vec()))
                    }
                    _ => Some(None),
                },
                None => None,
            }
        };

        match live {
            Some(Some(payload)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(payload))
            }
            Some(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.remove_expired(key)?;
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

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);
        let mut full_bytes = Vec::with_capacity(EXPIRY_PREFIX_LEN + value.len());
        full_bytes.extend_from_slice(&expires_at.to_le_bytes());
        full_bytes.extend_from_slice(&value);

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &full_bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClassbookResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn max_entry_bytes(&self) -> usize {
        self.ceiling_bytes
    }

    async fn stats(&self) -> ClassbookResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut entry_count = 0u64;
        let mut memory_bytes = 0u64;
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let (_, value) = item.map_err(txn_err)?;
            entry_count += 1;
            memory_bytes += value.len().saturating_sub(EXPIRY_PREFIX_LEN) as u64;
        }
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_medium(ceiling_bytes: usize) -> (LmdbCacheMedium, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let medium = LmdbCacheMedium::new(temp_dir.path(), 10, ceiling_bytes)
            .expect("medium creation should succeed");
        (medium, temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (medium, _dir) = create_test_medium(4096);
        medium
            .put("classbook:roster", b"[1,2,3]".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            medium.get("classbook:roster").await.unwrap(),
            Some(b"[1,2,3]".to_vec())
        );

        medium.delete("classbook:roster").await.unwrap();
        assert_eq!(medium.get("classbook:roster").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ceiling_enforced() {
        let (medium, _dir) = create_test_medium(16);
        let err = medium
            .put("k", vec![7u8; 17], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassbookError::Cache(CacheError::EntryTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed() {
        let (medium, _dir) = create_test_medium(4096);
        medium
            .put("k", b"stale".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(medium.get("k").await.unwrap(), None);

        let stats = medium.stats().await.unwrap();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let medium = LmdbCacheMedium::new(temp_dir.path(), 10, 4096).unwrap();
            medium
                .put("k", b"kept".to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let reopened = LmdbCacheMedium::new(temp_dir.path(), 10, 4096).unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(b"kept".to_vec()));
    }
}
