//! Classbook Test Utilities
//!
//! Shared test infrastructure for the Classbook workspace:
//! - Proptest generators for entities and configuration
//! - Fixtures for lessons, reservations, rosters and caches
//! - Assertions for booking rejections and the capacity invariant
//! - Tracing initialisation for test binaries

// Re-export mock storage from its source crate
pub use classbook_storage::MockRowStore;

// Re-export core types for convenience
pub use classbook_core::{
    AccountingDetails, AccountingLine, AccountingMasterItem, BookingError, ClassbookConfig,
    ClassbookError, ClassbookResult, ClassroomType, EntityIdType, Lesson, LessonId, Reservation,
    ReservationId, ReservationStatus, Student, StudentId, TimeRange, TimeWindows, Timestamp,
};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn` so passing runs stay quiet.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Classbook entities.

    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_lesson_id() -> impl Strategy<Value = LessonId> {
        arb_uuid().prop_map(LessonId::new)
    }

    pub fn arb_reservation_id() -> impl Strategy<Value = ReservationId> {
        arb_uuid().prop_map(ReservationId::new)
    }

    pub fn arb_student_id() -> impl Strategy<Value = StudentId> {
        arb_uuid().prop_map(StudentId::new)
    }

    /// Whole-hour time of day between 08:00 and 18:00.
    pub fn arb_hour() -> impl Strategy<Value = NaiveTime> {
        (8u32..=18).prop_map(|h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN))
    }

    /// Non-empty whole-hour window between 08:00 and 18:00.
    pub fn arb_time_range() -> impl Strategy<Value = TimeRange> {
        (8u32..18, 1u32..=4).prop_filter_map("window must end by 18:00", |(start, len)| {
            let end = start + len;
            if end > 18 {
                return None;
            }
            TimeRange::new(
                NaiveTime::from_hms_opt(start, 0, 0)?,
                NaiveTime::from_hms_opt(end, 0, 0)?,
            )
        })
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..86_400 * 365).prop_map(|offset| {
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()
                + chrono::Duration::seconds(offset)
        })
    }

    pub fn arb_classroom_type() -> impl Strategy<Value = ClassroomType> {
        prop_oneof![
            Just(ClassroomType::SessionBased),
            Just(ClassroomType::TimeDual),
            Just(ClassroomType::TimeFull),
        ]
    }

    pub fn arb_reservation_status() -> impl Strategy<Value = ReservationStatus> {
        prop_oneof![
            Just(ReservationStatus::Confirmed),
            Just(ReservationStatus::Waitlisted),
            Just(ReservationStatus::Completed),
            Just(ReservationStatus::Canceled),
        ]
    }

    pub fn arb_student() -> impl Strategy<Value = Student> {
        (
            arb_student_id(),
            "[A-Z][a-z]{2,10}",
            proptest::option::of("[a-z]{3,8}@example\\.test"),
        )
            .prop_map(|(student_id, name, contact)| Student {
                student_id,
                name,
                contact,
            })
    }

    /// A lesson with both blocks configured, so every mode is usable.
    pub fn arb_lesson() -> impl Strategy<Value = Lesson> {
        (
            arb_lesson_id(),
            arb_classroom_type(),
            1u32..=6,
            proptest::option::of(1u32..=3),
            0i64..60,
        )
            .prop_map(|(lesson_id, classroom_type, total, beginner, day)| {
                let mut lesson = fixtures::lesson(classroom_type, total);
                lesson.lesson_id = lesson_id;
                lesson.beginner_capacity = beginner;
                lesson.date = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap_or_default()
                    + chrono::Duration::days(day);
                lesson
            })
    }

    /// A reservation against `lesson` with arbitrary window, flag and status.
    pub fn arb_reservation_for(lesson: Lesson) -> impl Strategy<Value = Reservation> {
        (
            arb_reservation_id(),
            arb_student_id(),
            proptest::option::of(arb_time_range()),
            arb_reservation_status(),
            any::<bool>(),
            arb_timestamp(),
        )
            .prop_map(move |(reservation_id, student_id, window, status, first_lecture, created_at)| {
                Reservation {
                    reservation_id,
                    lesson_id: lesson.lesson_id,
                    student_id,
                    date: lesson.date,
                    classroom: lesson.classroom.clone(),
                    start_time: window.map(|w| w.start),
                    end_time: window.map(|w| w.end),
                    status,
                    first_lecture,
                    created_at,
                    notes: None,
                    accounting: None,
                }
            })
    }

    /// Configurations that pass [`ClassbookConfig::validate`].
    pub fn arb_valid_config() -> impl Strategy<Value = ClassbookConfig> {
        (1u32..=200, 1u32..=50, 1u32..=64, 1u64..=86_400, 1u64..=120_000, 1u64..=60_000).prop_map(
            |(entry_kb, headroom_kb, max_chunks, ttl, rebuild_ms, lock_ms)| {
                let mut config = ClassbookConfig::defaults();
                config.cache.max_entry_size_kb = entry_kb;
                config.cache.medium_ceiling_kb = entry_kb + headroom_kb;
                config.cache.max_chunks = max_chunks;
                config.cache.entry_ttl_secs = ttl;
                config.cache.rebuild_wait_timeout_ms = rebuild_ms;
                config.booking.lock_timeout_ms = lock_ms;
                config
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use classbook_storage::{ChunkedCacheStore, InMemoryCacheMedium, VersionedCache};
    use std::sync::Arc;

    /// `h:00` as a time of day.
    pub fn hour(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn lesson_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 6).unwrap_or_default()
    }

    /// Lesson with morning 09-12 and afternoon 13-16 blocks and a beginner
    /// slot of one seat.
    pub fn lesson(classroom_type: ClassroomType, total_capacity: u32) -> Lesson {
        Lesson {
            lesson_id: LessonId::now_v7(),
            date: lesson_date(),
            classroom: "Studio A".to_string(),
            classroom_type,
            venue: Some("Main Street".to_string()),
            time_windows: TimeWindows {
                first: TimeRange::new(hour(9), hour(12)),
                second: TimeRange::new(hour(13), hour(16)),
                beginner_start: Some(hour(10)),
            },
            total_capacity,
            beginner_capacity: Some(1),
            reservation_ids: Vec::new(),
        }
    }

    pub fn time_dual_lesson(total_capacity: u32) -> Lesson {
        lesson(ClassroomType::TimeDual, total_capacity)
    }

    pub fn time_full_lesson(total_capacity: u32, beginner_capacity: u32) -> Lesson {
        let mut lesson = lesson(ClassroomType::TimeFull, total_capacity);
        lesson.time_windows.first = TimeRange::new(hour(9), hour(17));
        lesson.time_windows.second = None;
        lesson.beginner_capacity = Some(beginner_capacity);
        lesson
    }

    /// Session reservation for a fresh student, created `minute` minutes
    /// after a fixed base time.
    pub fn reservation(lesson: &Lesson, status: ReservationStatus, minute: i64) -> Reservation {
        Reservation {
            reservation_id: ReservationId::now_v7(),
            lesson_id: lesson.lesson_id,
            student_id: StudentId::now_v7(),
            date: lesson.date,
            classroom: lesson.classroom.clone(),
            start_time: None,
            end_time: None,
            status,
            first_lecture: false,
            created_at: Utc
                .with_ymd_and_hms(2025, 9, 1, 8, 0, 0)
                .single()
                .unwrap_or_default()
                + chrono::Duration::minutes(minute),
            notes: None,
            accounting: None,
        }
    }

    pub fn windowed_reservation(
        lesson: &Lesson,
        status: ReservationStatus,
        minute: i64,
        (start, end): (u32, u32),
    ) -> Reservation {
        let mut reservation = reservation(lesson, status, minute);
        reservation.start_time = Some(hour(start));
        reservation.end_time = Some(hour(end));
        reservation
    }

    pub fn students(n: usize) -> Vec<Student> {
        (0..n)
            .map(|i| Student {
                student_id: StudentId::now_v7(),
                name: format!("Student {}", i),
                contact: Some(format!("student{}@example.test", i)),
            })
            .collect()
    }

    /// TUITION 4000, CLAY 800, KIT 2500.
    pub fn accounting_master() -> Vec<AccountingMasterItem> {
        [
            ("TUITION", "Lesson fee", 4_000, "tuition"),
            ("CLAY", "Clay block", 800, "material"),
            ("KIT", "Starter kit", 2_500, "sales"),
        ]
        .into_iter()
        .map(|(code, name, price, kind)| AccountingMasterItem {
            item_code: code.to_string(),
            item_name: name.to_string(),
            unit_price: price,
            item_type: kind.to_string(),
        })
        .collect()
    }

    /// Config with tiny entries so small datasets are chunked.
    pub fn small_cache_config() -> ClassbookConfig {
        let mut config = ClassbookConfig::defaults();
        config.cache.max_entry_size_kb = 2;
        config.cache.medium_ceiling_kb = 3;
        config
    }

    /// Versioned cache over an in-memory medium sized from `config`.
    pub fn versioned_cache(rows: Arc<MockRowStore>, config: &ClassbookConfig) -> Arc<VersionedCache> {
        let medium = Arc::new(InMemoryCacheMedium::new(config.medium_ceiling_bytes()));
        Arc::new(VersionedCache::new(
            ChunkedCacheStore::new(medium, config),
            rows,
            config,
        ))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Classbook-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &ClassbookResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &ClassbookResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a result is exactly the given booking rejection.
    #[track_caller]
    pub fn assert_rejected<T: std::fmt::Debug>(result: &ClassbookResult<T>, expected: &BookingError) {
        match result {
            Err(ClassbookError::Booking(actual)) => assert_eq!(actual, expected),
            other => panic!("Expected booking rejection {:?}, got: {:?}", expected, other),
        }
    }

    #[track_caller]
    pub fn assert_lock_timeout<T: std::fmt::Debug>(result: &ClassbookResult<T>) {
        match result {
            Err(ClassbookError::Booking(BookingError::LockTimeout { .. })) => {}
            other => panic!("Expected LockTimeout, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &ClassbookResult<T>) {
        match result {
            Err(ClassbookError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_valid(config: &ClassbookConfig) {
        if let Err(e) = config.validate() {
            panic!("Expected valid config, got: {}", e);
        }
    }

    /// Check the capacity invariant of one lesson by direct counting.
    ///
    /// TimeDual blocks are checked only when both blocks are configured and
    /// ordered; otherwise the session rule applies.
    #[track_caller]
    pub fn assert_capacity_invariant(lesson: &Lesson, reservations: &[Reservation]) {
        let seated: Vec<&Reservation> = reservations
            .iter()
            .filter(|r| r.lesson_id == lesson.lesson_id && r.status == ReservationStatus::Confirmed)
            .collect();
        let total = lesson.total_capacity as usize;

        match (lesson.classroom_type, lesson.time_windows.dual_blocks()) {
            (ClassroomType::TimeDual, Some((first, second))) => {
                let in_first = |r: &&&Reservation| r.window().is_some_and(|w| w.end <= first.end);
                let in_second =
                    |r: &&&Reservation| r.window().is_some_and(|w| w.start >= second.start);
                let first_only = seated.iter().filter(in_first).count();
                let second_only = seated.iter().filter(in_second).count();
                let spanning = seated.len() - first_only - second_only;
                assert!(
                    first_only + spanning <= total,
                    "first block over capacity: {} + {} > {} in lesson {}",
                    first_only,
                    spanning,
                    total,
                    lesson.lesson_id
                );
                assert!(
                    second_only + spanning <= total,
                    "second block over capacity: {} + {} > {} in lesson {}",
                    second_only,
                    spanning,
                    total,
                    lesson.lesson_id
                );
            }
            (classroom_type, _) => {
                assert!(
                    seated.len() <= total,
                    "{} confirmed seats exceed capacity {} in lesson {}",
                    seated.len(),
                    total,
                    lesson.lesson_id
                );
                if classroom_type == ClassroomType::TimeFull {
                    if let Some(cap) = lesson.beginner_capacity {
                        let beginners = seated.iter().filter(|r| r.first_lecture).count();
                        assert!(
                            beginners <= cap as usize,
                            "{} beginners exceed beginner capacity {} in lesson {}",
                            beginners,
                            cap,
                            lesson.lesson_id
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_lesson_has_ordered_blocks() {
        let lesson = fixtures::time_dual_lesson(2);
        assert!(lesson.time_windows.dual_blocks().is_some());
        assert!(fixtures::time_full_lesson(4, 1).time_windows.dual_blocks().is_none());
    }

    #[test]
    fn test_accounting_master_codes_are_unique() {
        let master = fixtures::accounting_master();
        let mut codes: Vec<_> = master.iter().map(|m| m.item_code.clone()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), master.len());
    }

    #[test]
    #[should_panic(expected = "exceed capacity")]
    fn test_capacity_invariant_detects_overbooking() {
        let lesson = fixtures::lesson(ClassroomType::SessionBased, 1);
        let rows = vec![
            fixtures::reservation(&lesson, ReservationStatus::Confirmed, 0),
            fixtures::reservation(&lesson, ReservationStatus::Confirmed, 1),
        ];
        assertions::assert_capacity_invariant(&lesson, &rows);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_config_is_valid(config in generators::arb_valid_config()) {
            assertions::assert_config_valid(&config);
        }

        #[test]
        fn prop_generated_windows_are_ordered(window in generators::arb_time_range()) {
            prop_assert!(window.start < window.end);
        }

        #[test]
        fn prop_generated_reservations_belong_to_lesson(
            (lesson, reservation) in generators::arb_lesson().prop_flat_map(|lesson| {
                (Just(lesson.clone()), generators::arb_reservation_for(lesson))
            })
        ) {
            prop_assert_eq!(reservation.lesson_id, lesson.lesson_id);
            prop_assert_eq!(reservation.date, lesson.date);
        }
    }
}
