//! Size-chunked cache store.
//!
//! A dataset is a header plus a collection of rows. If the whole dataset
//! serializes under the entry limit it is stored as one entry under `key`.
//! Otherwise the row collection is split into groups, each group is written
//! to `key#chunk#i`, and a metadata entry is written to `key` last.
//!
//! # Visibility
//!
//! Every chunk carries the version of the write that produced it. A reader
//! accepts a chunked entry only if every chunk is present and carries the
//! metadata's version, so readers see all of version N or a miss, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use classbook_core::{CacheError, ClassbookConfig, ClassbookResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::medium::CacheMedium;

/// Bytes reserved in every chunk for the envelope around its rows.
const CHUNK_ENVELOPE_BYTES: usize = 256;

/// Key of chunk `index` under `key`.
pub fn chunk_key(key: &str, index: usize) -> String {
    format!("{}#chunk#{}", key, index)
}

// ============================================================================
// STORED FORMAT
// ============================================================================

/// Column layout the cached rows were encoded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSchema {
    pub schema_version: u32,
    pub columns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    version: u64,
    chunked: bool,
    total_chunks: usize,
    total_count: usize,
    header: HeaderSchema,
    /// Inline rows of an unchunked entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkEnvelope {
    version: u64,
    index: usize,
    rows: Vec<Value>,
}

// ============================================================================
// READ RESULTS
// ============================================================================

/// A fully reassembled dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSet<T> {
    pub base_key: String,
    pub version: u64,
    pub chunked: bool,
    /// Number of chunk entries; zero for an unchunked entry
    pub total_chunks: usize,
    pub total_count: usize,
    pub header: HeaderSchema,
    pub rows: Vec<T>,
}

/// Why a read produced no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Malformed(String),
    ChunkMissing { index: usize },
    ChunkVersionMismatch { index: usize, expected: u64, found: u64 },
}

/// Outcome of a cache read. A miss is never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss(MissReason),
}

impl<T> CacheLookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            CacheLookup::Hit(value) => Some(value),
            CacheLookup::Miss(_) => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Chunking key/value store over a [`CacheMedium`].
pub struct ChunkedCacheStore {
    medium: Arc<dyn CacheMedium>,
    max_entry_bytes: usize,
    max_chunks: usize,
    ttl: Duration,
    /// High-water mark of issued versions, so versions stay monotonic even
    /// after a metadata entry is evicted.
    last_issued: AtomicU64,
}

impl ChunkedCacheStore {
    /// Build a store. The entry limit is the configured size, clamped to
    /// the medium's own ceiling.
    pub fn new(medium: Arc<dyn CacheMedium>, config: &ClassbookConfig) -> Self {
        let max_entry_bytes = config.max_entry_bytes().min(medium.max_entry_bytes());
        Self {
            medium,
            max_entry_bytes,
            max_chunks: config.max_chunks(),
            ttl: config.entry_ttl(),
            last_issued: AtomicU64::new(0),
        }
    }

    pub fn medium(&self) -> &Arc<dyn CacheMedium> {
        &self.medium
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Store `rows` under `key` and return the new version.
    ///
    /// # Errors
    ///
    /// - [`CacheError::RowTooLarge`] if one row alone exceeds the entry limit
    /// - [`CacheError::ChunkLimitExceeded`] if more than `max_chunks` groups are needed
    /// - medium errors from writing any entry
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        header: &HeaderSchema,
        rows: &[T],
    ) -> ClassbookResult<u64> {
        let values = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| serialization_error(key, e))?;

        let previous = self.read_metadata(key).await?;
        let previous_chunks = match &previous {
            Some(meta) if meta.chunked => meta.total_chunks,
            _ => 0,
        };
        let version = self.next_version(previous.as_ref().map(|m| m.version));

        let mut single = EntryMetadata {
            version,
            chunked: false,
            total_chunks: 0,
            total_count: values.len(),
            header: header.clone(),
            rows: Some(values),
        };
        let single_bytes = serde_json::to_vec(&single).map_err(|e| serialization_error(key, e))?;

        if single_bytes.len() <= self.max_entry_bytes {
            self.medium.put(key, single_bytes, self.ttl).await?;
            self.delete_chunks(key, 0..previous_chunks).await;
            debug!(key, version, rows = single.total_count, "Stored unchunked cache entry");
            return Ok(version);
        }

        let values = single.rows.take().unwrap_or_default();
        let groups = self.split_rows(key, values)?;
        let total_chunks = groups.len();

        for (index, group) in groups.into_iter().enumerate() {
            let envelope = ChunkEnvelope {
                version,
                index,
                rows: group,
            };
            let bytes = serde_json::to_vec(&envelope).map_err(|e| serialization_error(key, e))?;
            self.medium.put(&chunk_key(key, index), bytes, self.ttl).await?;
        }

        let metadata = EntryMetadata {
            chunked: true,
            total_chunks,
            ..single
        };
        let bytes = serde_json::to_vec(&metadata).map_err(|e| serialization_error(key, e))?;
        self.medium.put(key, bytes, self.ttl).await?;

        self.delete_chunks(key, total_chunks..previous_chunks).await;
        debug!(
            key,
            version,
            rows = metadata.total_count,
            chunks = total_chunks,
            "Stored chunked cache entry"
        );
        Ok(version)
    }

    /// Read and reassemble the dataset under `key`.
    ///
    /// Absent, malformed, partially evicted or mixed-version entries are all
    /// reported as [`CacheLookup::Miss`]. Only medium failures are errors.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> ClassbookResult<CacheLookup<ChunkSet<T>>> {
        let metadata = match self.read_metadata_checked(key).await? {
            Ok(metadata) => metadata,
            Err(reason) => return Ok(CacheLookup::Miss(reason)),
        };

        let values = if metadata.chunked {
            match self.read_chunks(key, &metadata).await? {
                Ok(values) => values,
                Err(reason) => return Ok(CacheLookup::Miss(reason)),
            }
        } else {
            match metadata.rows {
                Some(ref rows) => rows.clone(),
                None => {
                    return Ok(CacheLookup::Miss(MissReason::Malformed(
                        "unchunked entry without rows".to_string(),
                    )))
                }
            }
        };

        if values.len() != metadata.total_count {
            return Ok(CacheLookup::Miss(MissReason::Malformed(format!(
                "expected {} rows, found {}",
                metadata.total_count,
                values.len()
            ))));
        }

        let rows = match values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()
        {
            Ok(rows) => rows,
            Err(e) => return Ok(CacheLookup::Miss(MissReason::Malformed(e.to_string()))),
        };

        Ok(CacheLookup::Hit(ChunkSet {
            base_key: key.to_string(),
            version: metadata.version,
            chunked: metadata.chunked,
            total_chunks: metadata.total_chunks,
            total_count: metadata.total_count,
            header: metadata.header,
            rows,
        }))
    }

    /// Version of the entry under `key`, reading only its metadata.
    pub async fn version(&self, key: &str) -> ClassbookResult<Option<u64>> {
        Ok(self.read_metadata(key).await?.map(|m| m.version))
    }

    /// Remove the entry under `key` and all of its chunks.
    ///
    /// When the metadata is unreadable every possible chunk slot is cleared.
    pub async fn delete(&self, key: &str) -> ClassbookResult<()> {
        let chunks = match self.read_metadata(key).await? {
            Some(meta) if meta.chunked => meta.total_chunks.max(self.max_chunks),
            Some(_) => 0,
            None => self.max_chunks,
        };
        self.medium.delete(key).await?;
        for index in 0..chunks {
            self.medium.delete(&chunk_key(key, index)).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------

    fn next_version(&self, previous: Option<u64>) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let floor = previous.map_or(0, |v| v.saturating_add(1)).max(now);
        let mut current = self.last_issued.load(Ordering::SeqCst);
        loop {
            let next = floor.max(current.saturating_add(1));
            match self
                .last_issued
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Greedy split by serialized row size.
    fn split_rows(&self, key: &str, values: Vec<Value>) -> ClassbookResult<Vec<Vec<Value>>> {
        let budget = self.max_entry_bytes.saturating_sub(CHUNK_ENVELOPE_BYTES);
        let mut groups: Vec<Vec<Value>> = Vec::new();
        let mut current: Vec<Value> = Vec::new();
        let mut current_bytes = 0usize;

        for (row_index, value) in values.into_iter().enumerate() {
            let size = serde_json::to_vec(&value)
                .map_err(|e| serialization_error(key, e))?
                .len()
                + 1;
            if size > budget {
                return Err(CacheError::RowTooLarge {
                    key: key.to_string(),
                    row_index,
                    size_bytes: size - 1,
                    limit_bytes: budget,
                }
                .into());
            }
            if current_bytes + size > budget && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(value);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        if groups.len() > self.max_chunks {
            return Err(CacheError::ChunkLimitExceeded {
                key: key.to_string(),
                required: groups.len(),
                max: self.max_chunks,
            }
            .into());
        }
        Ok(groups)
    }

    async fn read_metadata(&self, key: &str) -> ClassbookResult<Option<EntryMetadata>> {
        Ok(self.read_metadata_checked(key).await?.ok())
    }

    async fn read_metadata_checked(
        &self,
        key: &str,
    ) -> ClassbookResult<Result<EntryMetadata, MissReason>> {
        let bytes = match self.medium.get(key).await? {
            Some(bytes) => bytes,
            None => return Ok(Err(MissReason::Absent)),
        };
        let metadata: EntryMetadata = match serde_json::from_slice(&bytes) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(key, error = %e, "Malformed cache metadata");
                return Ok(Err(MissReason::Malformed(e.to_string())));
            }
        };
        if metadata.chunked && (metadata.total_chunks == 0 || metadata.total_chunks > self.max_chunks) {
            return Ok(Err(MissReason::Malformed(format!(
                "chunk count {} outside 1..={}",
                metadata.total_chunks, self.max_chunks
            ))));
        }
        Ok(Ok(metadata))
    }

    async fn read_chunks(
        &self,
        key: &str,
        metadata: &EntryMetadata,
    ) -> ClassbookResult<Result<Vec<Value>, MissReason>> {
        let mut values = Vec::with_capacity(metadata.total_count);
        for index in 0..metadata.total_chunks {
            let bytes = match self.medium.get(&chunk_key(key, index)).await? {
                Some(bytes) => bytes,
                None => {
                    debug!(key, index, "Cache chunk missing");
                    return Ok(Err(MissReason::ChunkMissing { index }));
                }
            };
            let envelope: ChunkEnvelope = match serde_json::from_slice(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => return Ok(Err(MissReason::Malformed(e.to_string()))),
            };
            if envelope.version != metadata.version || envelope.index != index {
                debug!(
                    key,
                    index,
                    expected = metadata.version,
                    found = envelope.version,
                    "Cache chunk from another version"
                );
                return Ok(Err(MissReason::ChunkVersionMismatch {
                    index,
                    expected: metadata.version,
                    found: envelope.version,
                }));
            }
            values.extend(envelope.rows);
        }
        Ok(Ok(values))
    }

    /// Best-effort removal of leftover chunks.
    async fn delete_chunks(&self, key: &str, indices: std::ops::Range<usize>) {
        for index in indices {
            if let Err(e) = self.medium.delete(&chunk_key(key, index)).await {
                warn!(key, index, error = %e, "Failed to delete stale cache chunk");
            }
        }
    }
}

fn serialization_error(key: &str, e: serde_json::Error) -> classbook_core::ClassbookError {
    CacheError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

// =============================================================================
// TESTS
// =============================================================================
