//! Versioned, size-chunked read cache mirroring the row store.
//!
//! Layers, leaf-first:
//!
//! - [`CacheMedium`]: byte store with a hard per-entry ceiling and TTL
//!   ([`InMemoryCacheMedium`], [`LmdbCacheMedium`])
//! - [`ChunkedCacheStore`]: splits datasets into chunks under the ceiling and
//!   reassembles them all-or-nothing
//! - [`VersionedCache`]: per-dataset versions, typed decoding and debounced
//!   auto-rebuild from the row store
//! - [`IncrementalCacheUpdater`]: single-row patches on a resident snapshot
//!
//! Staleness is tolerated on the read path. Only the reservation mutation
//! path re-reads under the lock.

pub mod chunked;
pub mod incremental;
pub mod lmdb_medium;
pub mod medium;
pub mod versioned;

pub use chunked::{chunk_key, CacheLookup, ChunkSet, ChunkedCacheStore, HeaderSchema, MissReason};
pub use incremental::{IncrementalCacheUpdater, UpdateOutcome};
pub use lmdb_medium::{LmdbCacheError, LmdbCacheMedium};
pub use medium::{CacheMedium, CacheStats, InMemoryCacheMedium};
pub use versioned::{CachedDataset, VersionedCache};
