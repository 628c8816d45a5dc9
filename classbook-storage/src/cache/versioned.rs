//! Versioned dataset cache with auto-rebuild on miss.
//!
//! Each dataset lives under its own key and is rebuilt independently from a
//! full row store scan. Rebuilds are debounced per dataset: a caller that
//! misses while another rebuild of the same dataset is running waits for it
//! and reuses its result instead of scanning again.
//!
//! The same per-dataset guard orders rebuilds against incremental writes: a
//! rebuild's scan and put happen under it, and so does every read-modify-put
//! of [`IncrementalCacheUpdater`](super::IncrementalCacheUpdater). A snapshot
//! scanned before a committed write can therefore never be stored after the
//! patch that carries that write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use classbook_core::{ClassbookConfig, ClassbookResult, DatasetKind, HeaderIndex, Record};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::chunked::{CacheLookup, ChunkedCacheStore, HeaderSchema, MissReason};
use crate::RowStore;

/// A decoded, resident snapshot of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDataset<R> {
    pub dataset: DatasetKind,
    /// Opaque; compare for equality only
    pub version: u64,
    pub records: Vec<R>,
}

impl<R: Record> CachedDataset<R> {
    pub fn find(&self, id: &R::Id) -> Option<&R> {
        self.records.iter().find(|r| &r.row_id() == id)
    }

    pub fn position(&self, id: &R::Id) -> Option<usize> {
        self.records.iter().position(|r| &r.row_id() == id)
    }
}

/// Versioned cache over a [`ChunkedCacheStore`] and a [`RowStore`].
pub struct VersionedCache {
    store: ChunkedCacheStore,
    row_store: Arc<dyn RowStore>,
    rebuild_guards: [Mutex<()>; 4],
    rebuild_wait_timeout: Duration,
}

impl VersionedCache {
    pub fn new(store: ChunkedCacheStore, row_store: Arc<dyn RowStore>, config: &ClassbookConfig) -> Self {
        Self {
            store,
            row_store,
            rebuild_guards: Default::default(),
            rebuild_wait_timeout: config.rebuild_wait_timeout(),
        }
    }

    pub fn store(&self) -> &ChunkedCacheStore {
        &self.store
    }

    pub fn row_store(&self) -> &Arc<dyn RowStore> {
        &self.row_store
    }

    /// Read a dataset, rebuilding it from the row store on a miss.
    ///
    /// With `auto_rebuild = false` a miss returns `Ok(None)`.
    pub async fn get_cached_data<R: Record>(
        &self,
        auto_rebuild: bool,
    ) -> ClassbookResult<Option<CachedDataset<R>>> {
        match self.read::<R>().await? {
            CacheLookup::Hit(dataset) => {
                debug!(dataset = %R::DATASET, version = dataset.version, "Cache hit");
                return Ok(Some(dataset));
            }
            CacheLookup::Miss(reason) => {
                debug!(dataset = %R::DATASET, ?reason, auto_rebuild, "Cache miss");
            }
        }
        if !auto_rebuild {
            return Ok(None);
        }

        let _guard = match tokio::time::timeout(
            self.rebuild_wait_timeout,
            self.lock_dataset(R::DATASET),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                // Unguarded: never store this scan.
                warn!(
                    dataset = %R::DATASET,
                    waited_ms = self.rebuild_wait_timeout.as_millis() as u64,
                    "Timed out waiting for a concurrent rebuild; serving an unstored scan"
                );
                return self.scan_only::<R>().await.map(Some);
            }
        };

        // A concurrent caller may have rebuilt while we waited.
        if let CacheLookup::Hit(dataset) = self.read::<R>().await? {
            debug!(dataset = %R::DATASET, version = dataset.version, "Reused concurrent rebuild");
            return Ok(Some(dataset));
        }

        let rebuilt = self.rebuild_unguarded::<R>().await?;
        match self.read::<R>().await? {
            CacheLookup::Hit(dataset) => Ok(Some(dataset)),
            CacheLookup::Miss(reason) => {
                warn!(
                    dataset = %R::DATASET,
                    ?reason,
                    "Dataset missing right after rebuild; serving rebuilt snapshot"
                );
                Ok(Some(rebuilt))
            }
        }
    }

    /// Force a rebuild from a full row store scan, regardless of residency.
    pub async fn rebuild<R: Record>(&self) -> ClassbookResult<CachedDataset<R>> {
        let _guard = self.lock_dataset(R::DATASET).await;
        self.rebuild_unguarded::<R>().await
    }

    /// Take the dataset's rebuild guard.
    ///
    /// Held across any read-modify-put of a resident snapshot.
    pub async fn lock_dataset(&self, dataset: DatasetKind) -> MutexGuard<'_, ()> {
        self.guard(dataset).lock().await
    }

    /// Store a full snapshot of `records` and return the new version.
    pub async fn put_records<R: Record>(&self, records: &[R]) -> ClassbookResult<u64> {
        let rows: Vec<Vec<String>> = records.iter().map(Record::to_row).collect();
        self.store
            .put(R::DATASET.cache_key(), &header_schema::<R>(), &rows)
            .await
    }

    /// Drop a dataset's entries so the next read rebuilds it.
    pub async fn invalidate(&self, dataset: DatasetKind) -> ClassbookResult<()> {
        info!(dataset = %dataset, "Invalidating cached dataset");
        self.store.delete(dataset.cache_key()).await
    }

    /// Current version of every dataset, reading only metadata entries.
    pub async fn get_cache_versions(&self) -> ClassbookResult<BTreeMap<DatasetKind, Option<u64>>> {
        let mut versions = BTreeMap::new();
        for dataset in DatasetKind::ALL {
            versions.insert(dataset, self.store.version(dataset.cache_key()).await?);
        }
        Ok(versions)
    }

    // ------------------------------------------------------------------------

    fn guard(&self, dataset: DatasetKind) -> &Mutex<()> {
        let slot = match dataset {
            DatasetKind::Reservations => 0,
            DatasetKind::Schedule => 1,
            DatasetKind::AccountingMaster => 2,
            DatasetKind::Roster => 3,
        };
        &self.rebuild_guards[slot]
    }

    async fn read<R: Record>(&self) -> ClassbookResult<CacheLookup<CachedDataset<R>>> {
        let set = match self
            .store
            .get::<Vec<String>>(R::DATASET.cache_key())
            .await?
        {
            CacheLookup::Hit(set) => set,
            CacheLookup::Miss(reason) => return Ok(CacheLookup::Miss(reason)),
        };

        if set.header != header_schema::<R>() {
            return Ok(CacheLookup::Miss(MissReason::Malformed(format!(
                "cached schema version {} does not match {}",
                set.header.schema_version,
                R::SCHEMA_VERSION
            ))));
        }

        let index = HeaderIndex::canonical::<R>();
        let mut records = Vec::with_capacity(set.rows.len());
        for row in &set.rows {
            match R::from_row(&index, row) {
                Ok(record) => records.push(record),
                Err(e) => return Ok(CacheLookup::Miss(MissReason::Malformed(e.to_string()))),
            }
        }

        Ok(CacheLookup::Hit(CachedDataset {
            dataset: R::DATASET,
            version: set.version,
            records,
        }))
    }

    async fn scan<R: Record>(&self) -> ClassbookResult<Vec<R>> {
        let scanned = self.row_store.scan_all(R::DATASET).await?;
        let decoded = scanned.decode::<R>()?;
        for rejected in &decoded.rejected {
            warn!(
                dataset = %R::DATASET,
                row_index = rejected.row_index,
                error = %rejected.error,
                "Skipping undecodable row during rebuild"
            );
        }
        Ok(decoded.records)
    }

    /// Scan without storing; tagged with the currently stored version.
    async fn scan_only<R: Record>(&self) -> ClassbookResult<CachedDataset<R>> {
        let records = self.scan::<R>().await?;
        let version = self
            .store
            .version(R::DATASET.cache_key())
            .await?
            .unwrap_or_default();
        Ok(CachedDataset {
            dataset: R::DATASET,
            version,
            records,
        })
    }

    async fn rebuild_unguarded<R: Record>(&self) -> ClassbookResult<CachedDataset<R>> {
        let records = self.scan::<R>().await?;
        let version = self.put_records(&records).await?;
        info!(
            dataset = %R::DATASET,
            version,
            rows = records.len(),
            "Rebuilt cached dataset from row store"
        );
        Ok(CachedDataset {
            dataset: R::DATASET,
            version,
            records,
        })
    }
}

fn header_schema<R: Record>() -> HeaderSchema {
    HeaderSchema {
        schema_version: R::SCHEMA_VERSION,
        columns: R::columns().iter().map(|c| c.to_string()).collect(),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheMedium;
    use crate::MockRowStore;
    use classbook_core::{
        AccountingMasterItem, EntityIdType, RowSet, Student, StudentId,
    };

    struct Harness {
        cache: Arc<VersionedCache>,
        rows: Arc<MockRowStore>,
        medium: Arc<InMemoryCacheMedium>,
    }

    fn harness_with(rows: MockRowStore, config: ClassbookConfig) -> Harness {
        let rows = Arc::new(rows);
        let medium = Arc::new(InMemoryCacheMedium::new(config.medium_ceiling_bytes()));
        let store = ChunkedCacheStore::new(medium.clone(), &config);
        let cache = Arc::new(VersionedCache::new(store, rows.clone(), &config));
        Harness { cache, rows, medium }
    }

    fn harness() -> Harness {
        harness_with(MockRowStore::new(), ClassbookConfig::defaults())
    }

    fn students(n: usize) -> Vec<Student> {
        (0..n)
            .map(|i| Student {
                student_id: StudentId::now_v7(),
                name: format!("Student {}", i),
                contact: Some(format!("s{}@example.test", i)),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_miss_without_rebuild_returns_none() {
        let h = harness();
        let data = h.cache.get_cached_data::<Student>(false).await.unwrap();
        assert!(data.is_none());
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 0);
    }

    #[tokio::test]
    async fn test_miss_rebuilds_then_hits() {
        let h = harness();
        let roster = students(3);
        h.rows.seed(&roster).unwrap();

        let first = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        assert_eq!(first.records, roster);
        let second = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        assert_eq!(second.version, first.version);
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 1);
    }

    #[tokio::test]
    async fn test_datasets_rebuild_independently() {
        let h = harness();
        h.rows.seed(&students(2)).unwrap();
        h.rows
            .seed(&[AccountingMasterItem {
                item_code: "T1".to_string(),
                item_name: "Tuition".to_string(),
                unit_price: 3000,
                item_type: "tuition".to_string(),
            }])
            .unwrap();

        h.cache.get_cached_data::<Student>(true).await.unwrap();
        let items = h
            .cache
            .get_cached_data::<AccountingMasterItem>(true)
            .await
            .unwrap()
            .unwrap();
        let roster_version = h.cache.store().version(DatasetKind::Roster.cache_key()).await.unwrap();

        h.cache.rebuild::<AccountingMasterItem>().await.unwrap();
        assert_eq!(
            h.cache.store().version(DatasetKind::Roster.cache_key()).await.unwrap(),
            roster_version
        );
        assert_eq!(items.records.len(), 1);
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 1);
        assert_eq!(h.rows.scan_count(DatasetKind::AccountingMaster), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_scan_once() {
        let h = harness_with(
            MockRowStore::new().with_scan_delay(Duration::from_millis(50)),
            ClassbookConfig::defaults(),
        );
        h.rows.seed(&students(5)).unwrap();

        let a = {
            let cache = h.cache.clone();
            tokio::spawn(async move { cache.get_cached_data::<Student>(true).await })
        };
        let b = {
            let cache = h.cache.clone();
            tokio::spawn(async move { cache.get_cached_data::<Student>(true).await })
        };
        let a = a.await.unwrap().unwrap().unwrap();
        let b = b.await.unwrap().unwrap().unwrap();

        assert_eq!(a.version, b.version);
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_repaired_by_rebuild() {
        let mut config = ClassbookConfig::defaults();
        config.cache.max_entry_size_kb = 2;
        config.cache.medium_ceiling_kb = 3;
        let h = harness_with(MockRowStore::new(), config);
        let roster = students(60);
        h.rows.seed(&roster).unwrap();

        let first = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        let chunk = super::super::chunked::chunk_key(DatasetKind::Roster.cache_key(), 1);
        assert!(h.medium.evict(&chunk));

        assert!(h.cache.get_cached_data::<Student>(false).await.unwrap().is_none());
        let repaired = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        assert_eq!(repaired.records, roster);
        assert!(repaired.version > first.version);
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 2);
    }

    #[tokio::test]
    async fn test_bad_rows_skipped_and_missing_column_fails() {
        let h = harness();
        let roster = students(2);
        let mut set = RowSet::for_record::<Student>();
        set.rows = roster.iter().map(Record::to_row).collect();
        set.rows.push(vec!["garbage".to_string(), "X".to_string(), String::new()]);
        h.rows.replace_table(DatasetKind::Roster, set).unwrap();

        let data = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        assert_eq!(data.records, roster);

        h.rows
            .replace_table(
                DatasetKind::Roster,
                RowSet {
                    header: vec!["student_id".to_string()],
                    rows: vec![],
                },
            )
            .unwrap();
        assert!(h.cache.rebuild::<Student>().await.is_err());
    }

    #[tokio::test]
    async fn test_get_cache_versions_reads_metadata_only() {
        let h = harness();
        h.rows.seed(&students(1)).unwrap();
        let before = h.cache.get_cache_versions().await.unwrap();
        assert!(before.values().all(Option::is_none));

        let roster = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        let after = h.cache.get_cache_versions().await.unwrap();
        assert_eq!(after[&DatasetKind::Roster], Some(roster.version));
        assert_eq!(after[&DatasetKind::Schedule], None);
        assert_eq!(h.rows.scan_count(DatasetKind::Schedule), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let h = harness();
        h.rows.seed(&students(1)).unwrap();
        h.cache.get_cached_data::<Student>(true).await.unwrap();
        h.cache.invalidate(DatasetKind::Roster).await.unwrap();
        assert!(h.cache.get_cached_data::<Student>(false).await.unwrap().is_none());
        h.cache.get_cached_data::<Student>(true).await.unwrap();
        assert_eq!(h.rows.scan_count(DatasetKind::Roster), 2);
    }

    #[tokio::test]
    async fn test_rebuild_wait_timeout_serves_unstored_scan() {
        let mut config = ClassbookConfig::defaults();
        config.cache.rebuild_wait_timeout_ms = 20;
        let h = harness_with(MockRowStore::new(), config);
        let roster = students(2);
        h.rows.seed(&roster).unwrap();

        let held = h.cache.lock_dataset(DatasetKind::Roster).await;
        let served = h.cache.get_cached_data::<Student>(true).await.unwrap().unwrap();
        drop(held);

        assert_eq!(served.records, roster);
        assert!(h.cache.get_cached_data::<Student>(false).await.unwrap().is_none());
    }
}
