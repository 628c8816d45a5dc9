//! Property-Based Tests for Reservation Transactions
//!
//! **Capacity invariant**: for any sequence of create, cancel, confirm and
//! update operations, no lesson ever seats more confirmed parties than its
//! capacity allows for the pools they draw from.
//!
//! **Cache equivalence**: after the same sequence, the incrementally patched
//! cache equals a fresh decode of the row store.

use std::sync::Arc;

use classbook_core::{
    BookingError, ClassbookConfig, ClassroomType, EntityIdType, Lesson, Reservation, StudentId,
};
use classbook_reservations::{
    LockManager, LoggingNotificationSink, NewReservation, ReservationTransactionManager,
    ReservationUpdate,
};
use classbook_storage::MockRowStore;
use classbook_test_utils::{assertions, fixtures};
use proptest::prelude::*;

// ============================================================================
// OPERATIONS
// ============================================================================

const WINDOWS: [Option<(u32, u32)>; 6] = [
    None,
    Some((9, 12)),
    Some((13, 16)),
    Some((10, 14)),
    Some((9, 16)),
    Some((14, 15)),
];

#[derive(Debug, Clone)]
enum Op {
    Create {
        lesson: usize,
        student: usize,
        window: usize,
        first_lecture: bool,
    },
    Cancel(usize),
    Confirm(usize),
    Reschedule { pick: usize, window: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3, 0usize..8, 0usize..WINDOWS.len(), any::<bool>()).prop_map(
            |(lesson, student, window, first_lecture)| Op::Create {
                lesson,
                student,
                window,
                first_lecture,
            }
        ),
        2 => any::<usize>().prop_map(Op::Cancel),
        2 => any::<usize>().prop_map(Op::Confirm),
        1 => (any::<usize>(), 1usize..WINDOWS.len())
            .prop_map(|(pick, window)| Op::Reschedule { pick, window }),
    ]
}

fn lessons() -> Vec<Lesson> {
    let mut dated = vec![
        fixtures::lesson(ClassroomType::SessionBased, 2),
        fixtures::time_dual_lesson(2),
        fixtures::time_full_lesson(3, 1),
    ];
    // Separate dates so one student may hold a seat in each lesson.
    for (offset, lesson) in dated.iter_mut().enumerate() {
        lesson.date += chrono::Duration::days(offset as i64);
    }
    dated
}

async fn run(ops: Vec<Op>) -> (Vec<Lesson>, Arc<MockRowStore>, ReservationTransactionManager) {
    let config = ClassbookConfig::defaults();
    let lessons = lessons();
    let students: Vec<StudentId> = (0..8).map(|_| StudentId::now_v7()).collect();
    let rows = Arc::new(MockRowStore::new());
    rows.seed(&lessons).unwrap();
    let manager = ReservationTransactionManager::new(
        fixtures::versioned_cache(rows.clone(), &config),
        LockManager::in_process(&config),
        Arc::new(LoggingNotificationSink),
    );

    let mut created = Vec::new();
    for op in ops {
        let result = match op {
            Op::Create {
                lesson,
                student,
                window,
                first_lecture,
            } => {
                let mut request = NewReservation::session(lessons[lesson].lesson_id, students[student]);
                if let Some((start, end)) = WINDOWS[window] {
                    request = request.with_window(fixtures::hour(start), fixtures::hour(end));
                }
                if first_lecture {
                    request = request.first_lecture();
                }
                manager.create_reservation(request).await.map(|c| {
                    created.push(c.reservation.reservation_id);
                })
            }
            Op::Cancel(pick) if !created.is_empty() => manager
                .cancel_reservation(created[pick % created.len()])
                .await
                .map(|_| ()),
            Op::Confirm(pick) if !created.is_empty() => manager
                .confirm_waitlisted(created[pick % created.len()])
                .await
                .map(|_| ()),
            Op::Reschedule { pick, window } if !created.is_empty() => {
                let (start, end) = WINDOWS[window].unwrap_or((9, 12));
                manager
                    .update_reservation_details(
                        created[pick % created.len()],
                        ReservationUpdate {
                            start_time: Some(fixtures::hour(start)),
                            end_time: Some(fixtures::hour(end)),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|_| ())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            let expected = matches!(
                e.as_booking(),
                Some(
                    BookingError::DuplicateBooking { .. }
                        | BookingError::CapacityExceeded { .. }
                        | BookingError::AlreadyFinal { .. }
                        | BookingError::InvalidTransition { .. }
                )
            );
            assert!(expected, "unexpected failure: {}", e);
        }
    }
    (lessons, rows, manager)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_capacity_invariant_holds(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (lessons, rows, _manager) = block_on(run(ops));
        let stored = rows.records::<Reservation>().unwrap();
        for lesson in &lessons {
            assertions::assert_capacity_invariant(lesson, &stored);
        }
    }

    #[test]
    fn prop_incremental_cache_matches_row_store(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let (_lessons, rows, manager) = block_on(run(ops));
        let (cached, cached_lessons) = block_on(async {
            (
                manager.get_cached_data::<Reservation>(true).await.unwrap().unwrap(),
                manager.get_cached_data::<Lesson>(true).await.unwrap().unwrap(),
            )
        });
        prop_assert_eq!(cached.records, rows.records::<Reservation>().unwrap());
        prop_assert_eq!(cached_lessons.records, rows.records::<Lesson>().unwrap());
    }
}
