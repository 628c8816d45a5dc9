//! Incremental updates applied to a resident cached snapshot.
//!
//! Single-row writes patch the cached dataset in place and re-put it under a
//! new version instead of rescanning the row store. Callers must hold the
//! reservation lock so cache mutations are totally ordered. Each
//! read-modify-put also holds the dataset's rebuild guard, so a rebuild whose
//! scan predates the caller's row store write is stored first and then
//! patched, never stored over the patch.

use std::sync::Arc;

use classbook_core::{ClassbookResult, Record, ReservationStatus, StatusRecord};
use tracing::{debug, warn};

use super::versioned::{CachedDataset, VersionedCache};

/// Result of an incremental update. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Snapshot patched and stored under `version`.
    Applied { version: u64 },
    /// Dataset not cached; the next read rebuilds it with the change.
    NotResident,
    /// Target row absent from the snapshot; dataset entry invalidated.
    RowNotFound,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Applies append, status, replace and column patches to cached datasets.
pub struct IncrementalCacheUpdater {
    cache: Arc<VersionedCache>,
}

impl IncrementalCacheUpdater {
    pub fn new(cache: Arc<VersionedCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<VersionedCache> {
        &self.cache
    }

    /// Append one record. A record whose id is already cached replaces it.
    pub async fn append_row<R: Record>(&self, record: R) -> ClassbookResult<UpdateOutcome> {
        let _guard = self.cache.lock_dataset(R::DATASET).await;
        let Some(mut snapshot) = self.resident::<R>().await? else {
            return Ok(UpdateOutcome::NotResident);
        };
        match snapshot.position(&record.row_id()) {
            Some(position) => {
                debug!(dataset = %R::DATASET, row_id = %record.row_id(), "Appended row already cached; replacing");
                snapshot.records[position] = record;
            }
            None => snapshot.records.push(record),
        }
        self.commit(snapshot).await
    }

    /// Change only the status of one record.
    pub async fn update_status<R: StatusRecord>(
        &self,
        row_id: &R::Id,
        status: ReservationStatus,
    ) -> ClassbookResult<UpdateOutcome> {
        self.patch::<R, _>(row_id, |record| {
            record.set_status(status);
            Ok(())
        })
        .await
    }

    /// Replace one record wholesale.
    pub async fn replace_row<R: Record>(
        &self,
        row_id: &R::Id,
        record: R,
    ) -> ClassbookResult<UpdateOutcome> {
        self.patch::<R, _>(row_id, move |existing| {
            *existing = record;
            Ok(())
        })
        .await
    }

    /// Patch a single named column of one record.
    ///
    /// An unknown column or unparseable value is an error and leaves the
    /// cache untouched.
    pub async fn update_column<R: Record>(
        &self,
        row_id: &R::Id,
        column: &str,
        value: &str,
    ) -> ClassbookResult<UpdateOutcome> {
        self.patch::<R, _>(row_id, |record| {
            record.set_column(column, value)?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------------

    async fn resident<R: Record>(&self) -> ClassbookResult<Option<CachedDataset<R>>> {
        let snapshot = self.cache.get_cached_data::<R>(false).await?;
        if snapshot.is_none() {
            debug!(dataset = %R::DATASET, "Dataset not resident; skipping incremental update");
        }
        Ok(snapshot)
    }

    async fn patch<R, F>(&self, row_id: &R::Id, apply: F) -> ClassbookResult<UpdateOutcome>
    where
        R: Record,
        F: FnOnce(&mut R) -> ClassbookResult<()>,
    {
        let _guard = self.cache.lock_dataset(R::DATASET).await;
        let Some(mut snapshot) = self.resident::<R>().await? else {
            return Ok(UpdateOutcome::NotResident);
        };
        let Some(position) = snapshot.position(row_id) else {
            warn!(
                dataset = %R::DATASET,
                row_id = %row_id,
                version = snapshot.version,
                "Row missing from cached snapshot; invalidating for rebuild"
            );
            self.cache.invalidate(R::DATASET).await?;
            return Ok(UpdateOutcome::RowNotFound);
        };

        apply(&mut snapshot.records[position])?;
        self.commit(snapshot).await
    }

    async fn commit<R: Record>(&self, snapshot: CachedDataset<R>) -> ClassbookResult<UpdateOutcome> {
        let previous = snapshot.version;
        let version = self.cache.put_records(&snapshot.records).await?;
        debug!(
            dataset = %R::DATASET,
            previous,
            version,
            rows = snapshot.records.len(),
            "Applied incremental cache update"
        );
        Ok(UpdateOutcome::Applied { version })
    }
}

// =============================================================================
// TESTS
// =============================================================================
