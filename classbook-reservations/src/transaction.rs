//! Lock-serialized reservation transactions.
//!
//! Every mutation follows the same path:
//!
//! ```text
//! Requested ─→ LockAcquired ─→ Validated ─→ Persisted ─→ CacheSynced ─→ Done
//!     │              │              │            │
//!     └──────────────┴──────────────┴────────────┴──→ Rejected (nothing written)
//! ```
//!
//! Validation always reads the cache *after* the lock is taken, so two
//! requests racing for the last seat are decided one after the other. The
//! row store write is the commit point; cache synchronisation and the lesson
//! back-reference are best-effort after it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use classbook_core::{
    AccountingDetails, AccountingMasterItem, BookingError, ClassbookResult, DatasetKind,
    EntityIdType, Lesson, LessonId, Record, Reservation, ReservationId, ReservationStatus,
    StudentId,
};
use classbook_storage::{
    CachedDataset, IncrementalCacheUpdater, RowPatch, UpdateOutcome, VersionedCache,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::capacity::{Availability, CapacityCalculator, CapacityRequest};
use crate::mutex::LockManager;
use crate::notify::{NotificationSink, WaitlistNotification};
use crate::waitlist::WaitlistNotifier;

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

/// Transaction progress, logged as the `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Requested,
    LockAcquired,
    Validated,
    Persisted,
    CacheSynced,
    Done,
    Rejected,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            TransactionState::Requested => "requested",
            TransactionState::LockAcquired => "lock_acquired",
            TransactionState::Validated => "validated",
            TransactionState::Persisted => "persisted",
            TransactionState::CacheSynced => "cache_synced",
            TransactionState::Done => "done",
            TransactionState::Rejected => "rejected",
        };
        write!(f, "{}", value)
    }
}

/// A booking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub lesson_id: LessonId,
    pub student_id: StudentId,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub first_lecture: bool,
    pub notes: Option<String>,
}

impl NewReservation {
    pub fn session(lesson_id: LessonId, student_id: StudentId) -> Self {
        Self {
            lesson_id,
            student_id,
            start_time: None,
            end_time: None,
            first_lecture: false,
            notes: None,
        }
    }

    pub fn with_window(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn first_lecture(mut self) -> Self {
        self.first_lecture = true;
        self
    }
}

/// Detail edits of an existing reservation. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationUpdate {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub first_lecture: Option<bool>,
    pub notes: Option<String>,
}

impl ReservationUpdate {
    fn apply(&self, reservation: &mut Reservation) {
        if let Some(start) = self.start_time {
            reservation.start_time = Some(start);
        }
        if let Some(end) = self.end_time {
            reservation.end_time = Some(end);
        }
        if let Some(first_lecture) = self.first_lecture {
            reservation.first_lecture = first_lecture;
        }
        if let Some(notes) = &self.notes {
            reservation.notes = Some(notes.clone());
        }
    }
}

/// A committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub reservation: Reservation,
    /// New reservations-cache version, if the resident snapshot was patched
    pub cache_version: Option<u64>,
}

/// A committed cancellation and the waitlist notifications it triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub committed: Committed,
    pub notifications: Vec<WaitlistNotification>,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ReservationTransactionManager {
    lock: LockManager,
    updater: IncrementalCacheUpdater,
    notifier: WaitlistNotifier,
}

impl ReservationTransactionManager {
    pub fn new(
        cache: Arc<VersionedCache>,
        lock: LockManager,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            lock,
            updater: IncrementalCacheUpdater::new(cache.clone()),
            notifier: WaitlistNotifier::new(cache, sink),
        }
    }

    pub fn cache(&self) -> &Arc<VersionedCache> {
        self.updater.cache()
    }

    /// Book a seat. A full lesson yields a `Waitlisted` reservation, not an error.
    pub async fn create_reservation(&self, request: NewReservation) -> ClassbookResult<Committed> {
        debug!(
            state = %TransactionState::Requested,
            lesson_id = %request.lesson_id,
            student_id = %request.student_id,
            "create_reservation"
        );
        let result = self.create_locked(request).await;
        finish("create_reservation", result)
    }

    /// Cancel a reservation. Waitlisted parties are notified after the lock
    /// is released when a confirmed seat was freed.
    pub async fn cancel_reservation(&self, reservation_id: ReservationId) -> ClassbookResult<Cancellation> {
        debug!(
            state = %TransactionState::Requested,
            reservation_id = %reservation_id,
            "cancel_reservation"
        );
        let (committed, freed_seat) = finish(
            "cancel_reservation",
            self.cancel_locked(reservation_id).await,
        )?;

        let notifications = if freed_seat {
            let lesson_id = committed.reservation.lesson_id;
            match self.notifier.on_capacity_freed(lesson_id).await {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(lesson_id = %lesson_id, error = %e, "Waitlist notification failed after cancel");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Ok(Cancellation {
            committed,
            notifications,
        })
    }

    /// Edit times, beginner flag or notes of a non-terminal reservation.
    pub async fn update_reservation_details(
        &self,
        reservation_id: ReservationId,
        update: ReservationUpdate,
    ) -> ClassbookResult<Committed> {
        debug!(
            state = %TransactionState::Requested,
            reservation_id = %reservation_id,
            "update_reservation_details"
        );
        let result = self.update_locked(reservation_id, update).await;
        finish("update_reservation_details", result)
    }

    /// Promote a waitlisted reservation to `Confirmed`.
    pub async fn confirm_waitlisted(&self, reservation_id: ReservationId) -> ClassbookResult<Committed> {
        debug!(
            state = %TransactionState::Requested,
            reservation_id = %reservation_id,
            "confirm_waitlisted"
        );
        let result = self.confirm_locked(reservation_id).await;
        finish("confirm_waitlisted", result)
    }

    /// Settle a confirmed reservation with validated accounting details.
    pub async fn complete_reservation(
        &self,
        reservation_id: ReservationId,
        accounting: AccountingDetails,
    ) -> ClassbookResult<Committed> {
        debug!(
            state = %TransactionState::Requested,
            reservation_id = %reservation_id,
            "complete_reservation"
        );
        let result = self.complete_locked(reservation_id, accounting).await;
        finish("complete_reservation", result)
    }

    /// Unserialized cached read; may be slightly stale.
    pub async fn get_cached_data<R: Record>(
        &self,
        auto_rebuild: bool,
    ) -> ClassbookResult<Option<CachedDataset<R>>> {
        self.cache().get_cached_data::<R>(auto_rebuild).await
    }

    pub async fn get_cache_versions(&self) -> ClassbookResult<BTreeMap<DatasetKind, Option<u64>>> {
        self.cache().get_cache_versions().await
    }

    /// Remaining seats of a lesson from the cached datasets.
    pub async fn availability(&self, lesson_id: LessonId) -> ClassbookResult<Availability> {
        let lesson = self.lesson(lesson_id).await?;
        let reservations = self.dataset::<Reservation>().await?;
        Ok(CapacityCalculator::availability(&lesson, &reservations.records))
    }

    // ------------------------------------------------------------------------
    // Locked bodies. The guard is dropped on every return path.
    // ------------------------------------------------------------------------

    async fn create_locked(&self, request: NewReservation) -> ClassbookResult<Committed> {
        let guard = self.lock.acquire("create_reservation").await?;
        debug!(state = %TransactionState::LockAcquired, lesson_id = %request.lesson_id, "create_reservation");

        let mut lesson = self.lesson(request.lesson_id).await?;
        let reservations = self.dataset::<Reservation>().await?;
        if let Some(existing) =
            confirmed_booking(&reservations.records, request.student_id, &lesson, None)
        {
            return Err(BookingError::DuplicateBooking {
                student_id: request.student_id,
                date: lesson.date,
                existing,
            }
            .into());
        }

        let mut reservation = Reservation {
            reservation_id: ReservationId::now_v7(),
            lesson_id: lesson.lesson_id,
            student_id: request.student_id,
            date: lesson.date,
            classroom: lesson.classroom.clone(),
            start_time: request.start_time,
            end_time: request.end_time,
            status: ReservationStatus::Confirmed,
            first_lecture: request.first_lecture,
            created_at: Utc::now(),
            notes: request.notes,
            accounting: None,
        };
        let capacity = CapacityRequest::for_reservation(&reservation);
        if CapacityCalculator::is_full(&lesson, &reservations.records, &capacity) {
            reservation.status = ReservationStatus::Waitlisted;
        }
        debug!(
            state = %TransactionState::Validated,
            reservation_id = %reservation.reservation_id,
            status = %reservation.status,
            "create_reservation"
        );

        self.cache()
            .row_store()
            .append_row(DatasetKind::Reservations, reservation.to_row())
            .await?;
        debug!(state = %TransactionState::Persisted, reservation_id = %reservation.reservation_id, "create_reservation");

        let cache_version = self.sync(self.updater.append_row(reservation.clone()).await).await;
        if lesson.link_reservation(reservation.reservation_id) {
            self.sync_lesson_link(&lesson).await;
        }
        debug!(state = %TransactionState::CacheSynced, reservation_id = %reservation.reservation_id, "create_reservation");

        drop(guard);
        info!(
            state = %TransactionState::Done,
            reservation_id = %reservation.reservation_id,
            lesson_id = %reservation.lesson_id,
            status = %reservation.status,
            "Reservation created"
        );
        Ok(Committed {
            reservation,
            cache_version,
        })
    }

    async fn cancel_locked(&self, reservation_id: ReservationId) -> ClassbookResult<(Committed, bool)> {
        let guard = self.lock.acquire("cancel_reservation").await?;
        debug!(state = %TransactionState::LockAcquired, reservation_id = %reservation_id, "cancel_reservation");

        let current = self.reservation(reservation_id).await?;
        if current.status.is_final() {
            return Err(BookingError::AlreadyFinal {
                reservation_id,
                status: current.status,
            }
            .into());
        }
        let freed_seat = current.is_confirmed();
        let mut canceled = current.clone();
        canceled.status = ReservationStatus::Canceled;
        debug!(state = %TransactionState::Validated, reservation_id = %reservation_id, freed_seat, "cancel_reservation");

        self.persist(&current, &canceled).await?;
        let cache_version = self
            .sync(
                self.updater
                    .update_status::<Reservation>(&reservation_id, ReservationStatus::Canceled)
                    .await,
            )
            .await;
        debug!(state = %TransactionState::CacheSynced, reservation_id = %reservation_id, "cancel_reservation");

        drop(guard);
        info!(
            state = %TransactionState::Done,
            reservation_id = %reservation_id,
            lesson_id = %canceled.lesson_id,
            "Reservation canceled"
        );
        Ok((
            Committed {
                reservation: canceled,
                cache_version,
            },
            freed_seat,
        ))
    }

    async fn update_locked(
        &self,
        reservation_id: ReservationId,
        update: ReservationUpdate,
    ) -> ClassbookResult<Committed> {
        let guard = self.lock.acquire("update_reservation_details").await?;
        debug!(state = %TransactionState::LockAcquired, reservation_id = %reservation_id, "update_reservation_details");

        let current = self.reservation(reservation_id).await?;
        if current.status.is_final() {
            return Err(BookingError::InvalidTransition {
                reservation_id,
                from: current.status,
                action: "update".to_string(),
            }
            .into());
        }
        let mut updated = current.clone();
        update.apply(&mut updated);

        if updated.is_confirmed() {
            let lesson = self.lesson(current.lesson_id).await?;
            let reservations = self.dataset::<Reservation>().await?;
            let before = CapacityRequest::for_reservation(&current);
            let after = CapacityRequest::for_reservation(&updated).excluding(reservation_id);
            let grows = !CapacityCalculator::placement(&lesson, &before)
                .covers(&CapacityCalculator::placement(&lesson, &after));
            if grows && CapacityCalculator::is_full(&lesson, &reservations.records, &after) {
                return Err(BookingError::CapacityExceeded {
                    lesson_id: lesson.lesson_id,
                }
                .into());
            }
        }
        debug!(state = %TransactionState::Validated, reservation_id = %reservation_id, "update_reservation_details");

        let patch = self.persist(&current, &updated).await?;
        let outcome = match patch.as_slice() {
            [] => None,
            [(column, value)] => Some(
                self.updater
                    .update_column::<Reservation>(&reservation_id, column, value)
                    .await,
            ),
            _ => Some(self.updater.replace_row(&reservation_id, updated.clone()).await),
        };
        let cache_version = match outcome {
            Some(outcome) => self.sync(outcome).await,
            None => None,
        };
        debug!(state = %TransactionState::CacheSynced, reservation_id = %reservation_id, "update_reservation_details");

        drop(guard);
        info!(
            state = %TransactionState::Done,
            reservation_id = %reservation_id,
            columns = patch.len(),
            "Reservation details updated"
        );
        Ok(Committed {
            reservation: updated,
            cache_version,
        })
    }

    async fn confirm_locked(&self, reservation_id: ReservationId) -> ClassbookResult<Committed> {
        let guard = self.lock.acquire("confirm_waitlisted").await?;
        debug!(state = %TransactionState::LockAcquired, reservation_id = %reservation_id, "confirm_waitlisted");

        let current = self.reservation(reservation_id).await?;
        if current.status != ReservationStatus::Waitlisted {
            return Err(BookingError::InvalidTransition {
                reservation_id,
                from: current.status,
                action: "confirm".to_string(),
            }
            .into());
        }
        let lesson = self.lesson(current.lesson_id).await?;
        let reservations = self.dataset::<Reservation>().await?;
        if let Some(existing) = confirmed_booking(
            &reservations.records,
            current.student_id,
            &lesson,
            Some(reservation_id),
        ) {
            return Err(BookingError::DuplicateBooking {
                student_id: current.student_id,
                date: lesson.date,
                existing,
            }
            .into());
        }
        let capacity = CapacityRequest::for_reservation(&current);
        if CapacityCalculator::is_full(&lesson, &reservations.records, &capacity) {
            return Err(BookingError::CapacityExceeded {
                lesson_id: lesson.lesson_id,
            }
            .into());
        }
        let mut confirmed = current.clone();
        confirmed.status = ReservationStatus::Confirmed;
        debug!(state = %TransactionState::Validated, reservation_id = %reservation_id, "confirm_waitlisted");

        self.persist(&current, &confirmed).await?;
        let cache_version = self
            .sync(
                self.updater
                    .update_status::<Reservation>(&reservation_id, ReservationStatus::Confirmed)
                    .await,
            )
            .await;
        debug!(state = %TransactionState::CacheSynced, reservation_id = %reservation_id, "confirm_waitlisted");

        drop(guard);
        info!(
            state = %TransactionState::Done,
            reservation_id = %reservation_id,
            lesson_id = %confirmed.lesson_id,
            "Waitlisted reservation confirmed"
        );
        Ok(Committed {
            reservation: confirmed,
            cache_version,
        })
    }

    async fn complete_locked(
        &self,
        reservation_id: ReservationId,
        accounting: AccountingDetails,
    ) -> ClassbookResult<Committed> {
        let guard = self.lock.acquire("complete_reservation").await?;
        debug!(state = %TransactionState::LockAcquired, reservation_id = %reservation_id, "complete_reservation");

        let current = self.reservation(reservation_id).await?;
        match current.status {
            ReservationStatus::Confirmed => {}
            status if status.is_final() => {
                return Err(BookingError::AlreadyFinal {
                    reservation_id,
                    status,
                }
                .into())
            }
            status => {
                return Err(BookingError::InvalidTransition {
                    reservation_id,
                    from: status,
                    action: "complete".to_string(),
                }
                .into())
            }
        }
        let master = self.dataset::<AccountingMasterItem>().await?;
        validate_accounting(reservation_id, &accounting, &master.records)?;

        let mut completed = current.clone();
        completed.status = ReservationStatus::Completed;
        completed.accounting = Some(accounting);
        debug!(state = %TransactionState::Validated, reservation_id = %reservation_id, "complete_reservation");

        self.persist(&current, &completed).await?;
        let cache_version = self
            .sync(self.updater.replace_row(&reservation_id, completed.clone()).await)
            .await;
        debug!(state = %TransactionState::CacheSynced, reservation_id = %reservation_id, "complete_reservation");

        drop(guard);
        info!(
            state = %TransactionState::Done,
            reservation_id = %reservation_id,
            total = completed.accounting.as_ref().map(|a| a.total).unwrap_or(0),
            "Reservation completed"
        );
        Ok(Committed {
            reservation: completed,
            cache_version,
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn dataset<R: Record>(&self) -> ClassbookResult<CachedDataset<R>> {
        Ok(self
            .cache()
            .get_cached_data::<R>(true)
            .await?
            .unwrap_or(CachedDataset {
                dataset: R::DATASET,
                version: 0,
                records: Vec::new(),
            }))
    }

    async fn lesson(&self, lesson_id: LessonId) -> ClassbookResult<Lesson> {
        self.dataset::<Lesson>()
            .await?
            .find(&lesson_id)
            .cloned()
            .ok_or_else(|| BookingError::LessonNotFound { lesson_id }.into())
    }

    async fn reservation(&self, reservation_id: ReservationId) -> ClassbookResult<Reservation> {
        self.dataset::<Reservation>()
            .await?
            .find(&reservation_id)
            .cloned()
            .ok_or_else(|| BookingError::ReservationNotFound { reservation_id }.into())
    }

    /// Write the changed cells of a reservation row. The only commit point.
    async fn persist(&self, before: &Reservation, after: &Reservation) -> ClassbookResult<RowPatch> {
        let patch = changed_cells(before, after);
        if patch.is_empty() {
            return Ok(patch);
        }
        self.cache()
            .row_store()
            .update_row(
                DatasetKind::Reservations,
                &before.reservation_id.to_string(),
                &patch,
            )
            .await?;
        debug!(
            state = %TransactionState::Persisted,
            reservation_id = %before.reservation_id,
            columns = patch.len(),
            "Reservation row written"
        );
        Ok(patch)
    }

    /// Cache sync after a commit. A failure here cannot undo the row store
    /// write, so the dataset is invalidated and rebuilt on the next read.
    async fn sync(&self, outcome: ClassbookResult<UpdateOutcome>) -> Option<u64> {
        match outcome {
            Ok(UpdateOutcome::Applied { version }) => Some(version),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Cache sync failed after commit; invalidating reservations");
                if let Err(e) = self.cache().invalidate(DatasetKind::Reservations).await {
                    warn!(error = %e, "Invalidating reservations cache failed");
                }
                None
            }
        }
    }

    /// Best-effort update of the lesson's reservation back-reference.
    async fn sync_lesson_link(&self, lesson: &Lesson) {
        let ids = lesson
            .reservation_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let write = self
            .cache()
            .row_store()
            .update_row(
                DatasetKind::Schedule,
                &lesson.lesson_id.to_string(),
                &[("reservation_ids".to_string(), ids)],
            )
            .await;
        if let Err(e) = write {
            warn!(lesson_id = %lesson.lesson_id, error = %e, "Lesson back-reference not updated");
            return;
        }
        match self.updater.replace_row(&lesson.lesson_id, lesson.clone()).await {
            Ok(outcome) => {
                debug!(lesson_id = %lesson.lesson_id, ?outcome, "Lesson back-reference synced")
            }
            Err(e) => {
                warn!(lesson_id = %lesson.lesson_id, error = %e, "Schedule cache not updated; invalidating");
                if let Err(e) = self.cache().invalidate(DatasetKind::Schedule).await {
                    warn!(error = %e, "Invalidating schedule cache failed");
                }
            }
        }
    }
}

// ============================================================================
// FREE FUNCTIONS
// ============================================================================

/// Log the terminal state of a transaction.
fn finish<T>(operation: &str, result: ClassbookResult<T>) -> ClassbookResult<T> {
    if let Err(e) = &result {
        match e.as_booking() {
            Some(_) => debug!(state = %TransactionState::Rejected, operation, error = %e, "Transaction rejected"),
            None => error!(state = %TransactionState::Rejected, operation, error = %e, "Transaction failed"),
        }
    }
    result
}

/// The student's other confirmed booking on the lesson's date, if any.
fn confirmed_booking(
    reservations: &[Reservation],
    student_id: StudentId,
    lesson: &Lesson,
    except: Option<ReservationId>,
) -> Option<ReservationId> {
    reservations
        .iter()
        .find(|r| {
            r.student_id == student_id
                && r.date == lesson.date
                && r.is_confirmed()
                && Some(r.reservation_id) != except
        })
        .map(|r| r.reservation_id)
}

/// `(column, value)` pairs that differ between two encodings of a record.
fn changed_cells<R: Record>(before: &R, after: &R) -> RowPatch {
    R::columns()
        .iter()
        .zip(before.to_row().into_iter().zip(after.to_row()))
        .filter(|(_, (old, new))| old != new)
        .map(|(column, (_, new))| (column.to_string(), new))
        .collect()
}

fn validate_accounting(
    reservation_id: ReservationId,
    accounting: &AccountingDetails,
    master: &[AccountingMasterItem],
) -> ClassbookResult<()> {
    let invalid = |reason: String| BookingError::InvalidAccounting {
        reservation_id,
        reason,
    };
    if accounting.items.is_empty() {
        return Err(invalid("no accounting items".to_string()).into());
    }

    let mut total: u64 = 0;
    for line in &accounting.items {
        let item = master
            .iter()
            .find(|m| m.item_code == line.item_code)
            .ok_or_else(|| invalid(format!("unknown item code {}", line.item_code)))?;
        if line.quantity == 0 {
            return Err(invalid(format!("zero quantity for {}", line.item_code)).into());
        }
        total = item
            .unit_price
            .checked_mul(u64::from(line.quantity))
            .and_then(|amount| total.checked_add(amount))
            .ok_or_else(|| invalid("total overflows".to_string()))?;
    }
    if total != accounting.total {
        return Err(invalid(format!(
            "total {} does not match item sum {}",
            accounting.total, total
        ))
        .into());
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
