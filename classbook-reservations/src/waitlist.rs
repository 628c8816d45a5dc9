//! Waitlist selection after capacity is freed.
//!
//! Runs outside the reservation lock and never mutates state. Promotion
//! itself goes through
//! [`ReservationTransactionManager::confirm_waitlisted`](crate::ReservationTransactionManager::confirm_waitlisted).

use std::sync::Arc;

use classbook_core::{
    BookingError, ClassbookResult, Lesson, LessonId, Record, Reservation, ReservationStatus,
    Student,
};
use classbook_storage::VersionedCache;
use tracing::{debug, warn};

use crate::capacity::{CapacityCalculator, CapacityRequest};
use crate::notify::{NotificationSink, WaitlistNotification};

pub struct WaitlistNotifier {
    cache: Arc<VersionedCache>,
    sink: Arc<dyn NotificationSink>,
}

impl WaitlistNotifier {
    pub fn new(cache: Arc<VersionedCache>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { cache, sink }
    }

    /// Notify waitlisted parties of `lesson_id` that fit the freed capacity.
    ///
    /// Parties are considered oldest first (`created_at`, then id). A party
    /// is selected when its requested window still has room after the
    /// parties selected before it; one that does not fit is skipped and later
    /// parties are still considered. Returns the notifications emitted,
    /// including those whose delivery failed.
    pub async fn on_capacity_freed(&self, lesson_id: LessonId) -> ClassbookResult<Vec<WaitlistNotification>> {
        let lesson = self
            .records::<Lesson>()
            .await?
            .into_iter()
            .find(|l| l.lesson_id == lesson_id)
            .ok_or(BookingError::LessonNotFound { lesson_id })?;
        let reservations: Vec<Reservation> = self
            .records::<Reservation>()
            .await?
            .into_iter()
            .filter(|r| r.lesson_id == lesson_id)
            .collect();

        let mut waiting: Vec<&Reservation> = reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Waitlisted)
            .collect();
        waiting.sort_by_key(|r| (r.created_at, r.reservation_id));

        let mut occupied: Vec<Reservation> =
            reservations.iter().filter(|r| r.is_confirmed()).cloned().collect();
        let mut selected = Vec::new();
        for candidate in waiting {
            let request = CapacityRequest::for_reservation(candidate);
            if CapacityCalculator::is_full(&lesson, &occupied, &request) {
                debug!(
                    lesson_id = %lesson_id,
                    reservation_id = %candidate.reservation_id,
                    "Waitlisted party does not fit freed capacity"
                );
                continue;
            }
            let mut simulated = candidate.clone();
            simulated.status = ReservationStatus::Confirmed;
            occupied.push(simulated);
            selected.push(candidate);
        }

        if selected.is_empty() {
            debug!(lesson_id = %lesson_id, "No waitlisted party to notify");
            return Ok(Vec::new());
        }

        let roster = self.roster().await;
        let notifications: Vec<WaitlistNotification> = selected
            .into_iter()
            .map(|r| WaitlistNotification {
                lesson_id,
                date: lesson.date,
                classroom: lesson.classroom.clone(),
                reservation_id: r.reservation_id,
                student_id: r.student_id,
                contact: roster
                    .iter()
                    .find(|s| s.student_id == r.student_id)
                    .and_then(|s| s.contact.clone()),
            })
            .collect();

        for notification in &notifications {
            if let Err(e) = self.sink.deliver(notification).await {
                warn!(
                    lesson_id = %lesson_id,
                    reservation_id = %notification.reservation_id,
                    error = %e,
                    "Waitlist notification delivery failed"
                );
            }
        }
        debug!(lesson_id = %lesson_id, notified = notifications.len(), "Waitlist notifications emitted");
        Ok(notifications)
    }

    async fn records<R: Record>(&self) -> ClassbookResult<Vec<R>> {
        Ok(self
            .cache
            .get_cached_data::<R>(true)
            .await?
            .map(|d| d.records)
            .unwrap_or_default())
    }

    /// Contacts are optional; a roster failure only drops them.
    async fn roster(&self) -> Vec<Student> {
        match self.records::<Student>().await {
            Ok(students) => students,
            Err(e) => {
                warn!(error = %e, "Roster unavailable; notifying without contacts");
                Vec::new()
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelNotificationSink, NotifyError};
    use async_trait::async_trait;
    use classbook_core::{ClassbookConfig, ClassroomType, EntityIdType};
    use classbook_storage::{ChunkedCacheStore, InMemoryCacheMedium, MockRowStore};
    use classbook_test_utils::fixtures;

    fn cache_over(rows: Arc<MockRowStore>) -> Arc<VersionedCache> {
        let config = ClassbookConfig::defaults();
        let medium = Arc::new(InMemoryCacheMedium::new(config.medium_ceiling_bytes()));
        Arc::new(VersionedCache::new(
            ChunkedCacheStore::new(medium, &config),
            rows,
            &config,
        ))
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _: &WaitlistNotification) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected {
                reason: "mailbox full".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_fifo_selection_within_capacity() {
        let rows = Arc::new(MockRowStore::new());
        let lesson = fixtures::lesson(ClassroomType::SessionBased, 3);
        let seated = fixtures::reservation(&lesson, ReservationStatus::Confirmed, 0);
        let late = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 30);
        let early = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 10);
        let middle = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 20);
        let students = vec![Student {
            student_id: early.student_id,
            name: "Noor".to_string(),
            contact: Some("noor@example.test".to_string()),
        }];
        rows.seed(&[lesson.clone()]).unwrap();
        rows.seed(&[seated, late, early.clone(), middle.clone()]).unwrap();
        rows.seed(&students).unwrap();

        let (sink, mut rx) = ChannelNotificationSink::channel(8);
        let notifier = WaitlistNotifier::new(cache_over(rows.clone()), Arc::new(sink));
        let sent = notifier.on_capacity_freed(lesson.lesson_id).await.unwrap();

        let ids: Vec<_> = sent.iter().map(|n| n.reservation_id).collect();
        assert_eq!(ids, vec![early.reservation_id, middle.reservation_id]);
        assert_eq!(sent[0].contact.as_deref(), Some("noor@example.test"));
        assert_eq!(sent[1].contact, None);
        assert_eq!(rx.recv().await.unwrap().reservation_id, early.reservation_id);
        assert_eq!(rx.recv().await.unwrap().reservation_id, middle.reservation_id);
        assert_eq!(rows.write_count(), 0);
    }

    #[tokio::test]
    async fn test_one_freed_seat_selects_earliest_only() {
        let rows = Arc::new(MockRowStore::new());
        let lesson = fixtures::lesson(ClassroomType::SessionBased, 2);
        let seated = fixtures::reservation(&lesson, ReservationStatus::Confirmed, 0);
        let a = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 10);
        let b = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 20);
        let c = fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 30);
        rows.seed(&[lesson.clone()]).unwrap();
        rows.seed(&[c, seated, b, a.clone()]).unwrap();

        let (sink, mut rx) = ChannelNotificationSink::channel(8);
        let notifier = WaitlistNotifier::new(cache_over(rows), Arc::new(sink));
        let sent = notifier.on_capacity_freed(lesson.lesson_id).await.unwrap();

        assert_eq!(
            sent.iter().map(|n| n.reservation_id).collect::<Vec<_>>(),
            vec![a.reservation_id]
        );
        assert_eq!(rx.recv().await.unwrap().reservation_id, a.reservation_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_party_that_does_not_fit_is_skipped() {
        let rows = Arc::new(MockRowStore::new());
        let lesson = fixtures::time_dual_lesson(1);
        let seated = fixtures::windowed_reservation(&lesson, ReservationStatus::Confirmed, 0, (9, 12));
        let spanning = fixtures::windowed_reservation(&lesson, ReservationStatus::Waitlisted, 5, (11, 14));
        let afternoon = fixtures::windowed_reservation(&lesson, ReservationStatus::Waitlisted, 9, (13, 16));
        rows.seed(&[lesson.clone()]).unwrap();
        rows.seed(&[seated, spanning, afternoon.clone()]).unwrap();

        let (sink, _rx) = ChannelNotificationSink::channel(8);
        let notifier = WaitlistNotifier::new(cache_over(rows), Arc::new(sink));
        let sent = notifier.on_capacity_freed(lesson.lesson_id).await.unwrap();
        assert_eq!(
            sent.iter().map(|n| n.reservation_id).collect::<Vec<_>>(),
            vec![afternoon.reservation_id]
        );
    }

    #[tokio::test]
    async fn test_delivery_failures_are_not_fatal() {
        let rows = Arc::new(MockRowStore::new());
        let lesson = fixtures::lesson(ClassroomType::SessionBased, 1);
        rows.seed(&[lesson.clone()]).unwrap();
        rows.seed(&[fixtures::reservation(&lesson, ReservationStatus::Waitlisted, 0)])
            .unwrap();

        let notifier = WaitlistNotifier::new(cache_over(rows), Arc::new(FailingSink));
        let sent = notifier.on_capacity_freed(lesson.lesson_id).await.unwrap();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_lesson_is_rejected() {
        let notifier = WaitlistNotifier::new(
            cache_over(Arc::new(MockRowStore::new())),
            Arc::new(FailingSink),
        );
        let lesson_id = LessonId::now_v7();
        let err = notifier.on_capacity_freed(lesson_id).await.unwrap_err();
        assert_eq!(
            err.as_booking(),
            Some(&BookingError::LessonNotFound { lesson_id })
        );
    }
}
