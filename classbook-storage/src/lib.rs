//! Classbook Storage - Row Store Trait, Mock Implementation and Cache Layer
//!
//! The row store is the durable source of truth: slow to scan in full, so
//! every dataset is mirrored into the versioned, chunked cache in [`cache`].

pub mod cache;

pub use cache::{
    CacheLookup, CacheMedium, CacheStats, CachedDataset, ChunkSet, ChunkedCacheStore,
    HeaderSchema, IncrementalCacheUpdater, InMemoryCacheMedium, LmdbCacheMedium, MissReason,
    UpdateOutcome, VersionedCache,
};

use async_trait::async_trait;
use classbook_core::{
    ClassbookError, ClassbookResult, DatasetKind, Record, RowSet, StorageError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A single-row patch: `(column, new value)` pairs.
pub type RowPatch = Vec<(String, String)>;

// ============================================================================
// ROW STORE TRAIT
// ============================================================================

/// Authoritative, table-like storage of every dataset.
///
/// Rows are matched by the value in the header's first column.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read the header and every row of a dataset.
    async fn scan_all(&self, dataset: DatasetKind) -> ClassbookResult<RowSet>;

    /// Append one row, cells in header order.
    async fn append_row(&self, dataset: DatasetKind, row: Vec<String>) -> ClassbookResult<()>;

    /// Overwrite the named cells of the row whose primary key is `row_id`.
    async fn update_row(
        &self,
        dataset: DatasetKind,
        row_id: &str,
        patch: &[(String, String)],
    ) -> ClassbookResult<()>;
}

// ============================================================================
// MOCK ROW STORE
// ============================================================================

/// In-memory row store for tests.
///
/// Counts full scans per dataset and can be told to fail writes, so callers
/// can assert on rebuild debouncing and failure paths.
#[derive(Debug, Default)]
pub struct MockRowStore {
    tables: Arc<RwLock<HashMap<DatasetKind, RowSet>>>,
    scans: Arc<RwLock<HashMap<DatasetKind, u64>>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
    scan_delay: Option<Duration>,
    scan_lag: Option<Duration>,
}

impl MockRowStore {
    /// Create a mock store with every dataset present and empty.
    pub fn new() -> Self {
        let store = Self::default();
        if let Ok(mut tables) = store.tables.write() {
            tables.insert(DatasetKind::Reservations, RowSet::for_record::<classbook_core::Reservation>());
            tables.insert(DatasetKind::Schedule, RowSet::for_record::<classbook_core::Lesson>());
            tables.insert(DatasetKind::Roster, RowSet::for_record::<classbook_core::Student>());
            tables.insert(
                DatasetKind::AccountingMaster,
                RowSet::for_record::<classbook_core::AccountingMasterItem>(),
            );
        }
        store
    }

    /// Make every full scan sleep first, widening race windows in tests.
    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = Some(delay);
        self
    }

    /// Make every full scan snapshot the table first and return it only after
    /// `lag`, so writes landing in between are missing from the result.
    pub fn with_scan_lag(mut self, lag: Duration) -> Self {
        self.scan_lag = Some(lag);
        self
    }

    /// Replace a dataset with the given records under the canonical header.
    pub fn seed<R: Record>(&self, records: &[R]) -> ClassbookResult<()> {
        let mut set = RowSet::for_record::<R>();
        set.rows = records.iter().map(Record::to_row).collect();
        self.replace_table(R::DATASET, set)
    }

    /// Replace a dataset with raw header and rows.
    pub fn replace_table(&self, dataset: DatasetKind, set: RowSet) -> ClassbookResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables.insert(dataset, set);
        Ok(())
    }

    /// Decode the current contents of a dataset, ignoring bad rows.
    pub fn records<R: Record>(&self) -> ClassbookResult<Vec<R>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        match tables.get(&R::DATASET) {
            Some(set) => Ok(set.decode::<R>()?.records),
            None => Ok(Vec::new()),
        }
    }

    /// Number of full scans served for a dataset.
    pub fn scan_count(&self, dataset: DatasetKind) -> u64 {
        self.scans
            .read()
            .map(|s| s.get(&dataset).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of successful appends and updates across all datasets.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail with [`StorageError::WriteFailed`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, dataset: DatasetKind) -> ClassbookResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                dataset,
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MockRowStore {
    async fn scan_all(&self, dataset: DatasetKind) -> ClassbookResult<RowSet> {
        if let Some(delay) = self.scan_delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut scans) = self.scans.write() {
            *scans.entry(dataset).or_insert(0) += 1;
        }
        let snapshot = {
            let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
            tables.get(&dataset).cloned()
        };
        if let Some(lag) = self.scan_lag {
            tokio::time::sleep(lag).await;
        }
        snapshot.ok_or_else(|| {
            StorageError::ScanFailed {
                dataset,
                reason: "table does not exist".to_string(),
            }
            .into()
        })
    }

    async fn append_row(&self, dataset: DatasetKind, row: Vec<String>) -> ClassbookResult<()> {
        self.check_writable(dataset)?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.get_mut(&dataset).ok_or(ClassbookError::Storage(
            StorageError::WriteFailed {
                dataset,
                reason: "table does not exist".to_string(),
            },
        ))?;
        table.rows.push(row);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_row(
        &self,
        dataset: DatasetKind,
        row_id: &str,
        patch: &[(String, String)],
    ) -> ClassbookResult<()> {
        self.check_writable(dataset)?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let not_found = || StorageError::RowNotFound {
            dataset,
            row_id: row_id.to_string(),
        };
        let table = tables.get_mut(&dataset).ok_or_else(not_found)?;

        let mut positions = Vec::with_capacity(patch.len());
        for (column, value) in patch {
            let position = table
                .header
                .iter()
                .position(|h| h.trim() == column)
                .ok_or_else(|| StorageError::WriteFailed {
                    dataset,
                    reason: format!("unknown column {}", column),
                })?;
            positions.push((position, value));
        }

        let header_len = table.header.len();
        let row = table
            .rows
            .iter_mut()
            .find(|r| r.first().map(|c| c.trim()) == Some(row_id))
            .ok_or_else(not_found)?;
        if row.len() < header_len {
            row.resize(header_len, String::new());
        }
        for (position, value) in positions {
            row[position] = value.clone();
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
