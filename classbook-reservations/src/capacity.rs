//! Remaining-seat arithmetic per classroom mode.
//!
//! | Mode         | Pools                                                    |
//! |--------------|----------------------------------------------------------|
//! | SessionBased | one pool of `total_capacity`                             |
//! | TimeDual     | first block, second block; spanning requests use both    |
//! | TimeFull     | one pool, plus a beginner sub-pool for first lectures    |
//!
//! Only `Confirmed` reservations occupy seats. All arithmetic saturates at
//! zero so an over-booked lesson reads as full rather than underflowing.

use classbook_core::{
    ClassroomType, Lesson, LessonId, Reservation, ReservationId, TimeRange,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a TimeDual request sits relative to the two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DualBlock {
    /// Ends no later than the first block ends
    First,
    /// Starts no earlier than the second block starts
    Second,
    /// Anything else, including requests without a window
    Spanning,
}

/// The pools a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Session,
    Dual(DualBlock),
    Full { beginner: bool },
}

impl Placement {
    /// True if every pool `other` draws from is already drawn from by `self`.
    pub fn covers(&self, other: &Placement) -> bool {
        match (self, other) {
            (Placement::Dual(DualBlock::Spanning), Placement::Dual(_)) => true,
            (Placement::Full { beginner: true }, Placement::Full { .. }) => true,
            (a, b) => a == b,
        }
    }
}

/// A seat request checked against a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityRequest {
    pub window: Option<TimeRange>,
    pub first_lecture: bool,
    /// Reservation left out of the occupancy count, for edits of an existing booking
    pub exclude: Option<ReservationId>,
}

impl CapacityRequest {
    pub fn for_reservation(reservation: &Reservation) -> Self {
        Self {
            window: reservation.window(),
            first_lecture: reservation.first_lecture,
            exclude: None,
        }
    }

    pub fn excluding(mut self, reservation_id: ReservationId) -> Self {
        self.exclude = Some(reservation_id);
        self
    }
}

/// Read-only remaining-seat summary of one lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub lesson_id: LessonId,
    /// Mode actually applied, after any fallback
    pub mode: ClassroomType,
    /// Seats for a request that draws only from the shared pool(s)
    pub overall: u32,
    pub first_block: Option<u32>,
    pub second_block: Option<u32>,
    pub beginner: Option<u32>,
}

impl Availability {
    pub fn is_full(&self) -> bool {
        self.overall == 0
    }
}

/// Effective accounting mode of a lesson.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Session,
    Dual { first: TimeRange, second: TimeRange },
    Full,
}

/// Confirmed-seat counts, per pool.
#[derive(Debug, Default)]
struct Occupancy {
    total: u32,
    first: u32,
    second: u32,
    spanning: u32,
    beginners: u32,
}

/// Stateless capacity arithmetic.
pub struct CapacityCalculator;

impl CapacityCalculator {
    /// Seats left for `request`. `reservations` may hold other lessons' rows;
    /// they are ignored.
    pub fn remaining(lesson: &Lesson, reservations: &[Reservation], request: &CapacityRequest) -> u32 {
        let mode = Self::mode(lesson);
        let occupancy = Self::occupancy(lesson, mode, reservations, request.exclude);
        let total = lesson.total_capacity;

        match (mode, Self::place(mode, request.window, request.first_lecture)) {
            (Mode::Dual { .. }, Placement::Dual(DualBlock::First)) => {
                total.saturating_sub(occupancy.first + occupancy.spanning)
            }
            (Mode::Dual { .. }, Placement::Dual(DualBlock::Second)) => {
                total.saturating_sub(occupancy.second + occupancy.spanning)
            }
            (Mode::Dual { .. }, _) => Self::dual_shared(total, &occupancy),
            (Mode::Full, Placement::Full { beginner: true }) => {
                Self::beginner_remaining(lesson, &occupancy)
                    .unwrap_or_else(|| total.saturating_sub(occupancy.total))
            }
            _ => total.saturating_sub(occupancy.total),
        }
    }

    pub fn is_full(lesson: &Lesson, reservations: &[Reservation], request: &CapacityRequest) -> bool {
        Self::remaining(lesson, reservations, request) == 0
    }

    /// Pools a request would draw from in `lesson`.
    pub fn placement(lesson: &Lesson, request: &CapacityRequest) -> Placement {
        Self::place(Self::mode(lesson), request.window, request.first_lecture)
    }

    /// Classify a window against a TimeDual lesson. `None` for other modes or
    /// when the lesson's blocks are not configured.
    pub fn classify(lesson: &Lesson, window: Option<TimeRange>) -> Option<DualBlock> {
        match lesson.classroom_type {
            ClassroomType::TimeDual => {
                let (first, second) = lesson.time_windows.dual_blocks()?;
                Some(classify_dual(first, second, window))
            }
            _ => None,
        }
    }

    pub fn availability(lesson: &Lesson, reservations: &[Reservation]) -> Availability {
        let mode = Self::mode(lesson);
        let occupancy = Self::occupancy(lesson, mode, reservations, None);
        let total = lesson.total_capacity;

        let (applied, overall, first_block, second_block, beginner) = match mode {
            Mode::Session => (
                ClassroomType::SessionBased,
                total.saturating_sub(occupancy.total),
                None,
                None,
                None,
            ),
            Mode::Dual { .. } => (
                ClassroomType::TimeDual,
                Self::dual_shared(total, &occupancy),
                Some(total.saturating_sub(occupancy.first + occupancy.spanning)),
                Some(total.saturating_sub(occupancy.second + occupancy.spanning)),
                None,
            ),
            Mode::Full => (
                ClassroomType::TimeFull,
                total.saturating_sub(occupancy.total),
                None,
                None,
                Self::beginner_remaining(lesson, &occupancy),
            ),
        };

        Availability {
            lesson_id: lesson.lesson_id,
            mode: applied,
            overall,
            first_block,
            second_block,
            beginner,
        }
    }

    // ------------------------------------------------------------------------

    fn mode(lesson: &Lesson) -> Mode {
        match lesson.classroom_type {
            ClassroomType::SessionBased => Mode::Session,
            ClassroomType::TimeFull => Mode::Full,
            ClassroomType::TimeDual => match lesson.time_windows.dual_blocks() {
                Some((first, second)) => Mode::Dual { first, second },
                None => {
                    warn!(
                        lesson_id = %lesson.lesson_id,
                        classroom = %lesson.classroom,
                        "TimeDual lesson has missing or malformed blocks; using session-based capacity"
                    );
                    Mode::Session
                }
            },
        }
    }

    fn place(mode: Mode, window: Option<TimeRange>, first_lecture: bool) -> Placement {
        match mode {
            Mode::Session => Placement::Session,
            Mode::Dual { first, second } => Placement::Dual(classify_dual(first, second, window)),
            Mode::Full => Placement::Full {
                beginner: first_lecture,
            },
        }
    }

    fn occupancy(
        lesson: &Lesson,
        mode: Mode,
        reservations: &[Reservation],
        exclude: Option<ReservationId>,
    ) -> Occupancy {
        let mut occupancy = Occupancy::default();
        let seated = reservations.iter().filter(|r| {
            r.lesson_id == lesson.lesson_id
                && r.is_confirmed()
                && Some(r.reservation_id) != exclude
        });
        for reservation in seated {
            occupancy.total += 1;
            match Self::place(mode, reservation.window(), reservation.first_lecture) {
                Placement::Dual(DualBlock::First) => occupancy.first += 1,
                Placement::Dual(DualBlock::Second) => occupancy.second += 1,
                Placement::Dual(DualBlock::Spanning) => occupancy.spanning += 1,
                Placement::Full { beginner: true } => occupancy.beginners += 1,
                Placement::Full { beginner: false } | Placement::Session => {}
            }
        }
        occupancy
    }

    fn dual_shared(total: u32, occupancy: &Occupancy) -> u32 {
        let first = total.saturating_sub(occupancy.first + occupancy.spanning);
        let second = total.saturating_sub(occupancy.second + occupancy.spanning);
        first.min(second)
    }

    fn beginner_remaining(lesson: &Lesson, occupancy: &Occupancy) -> Option<u32> {
        let overall = lesson.total_capacity.saturating_sub(occupancy.total);
        lesson
            .beginner_capacity
            .map(|cap| overall.min(cap.saturating_sub(occupancy.beginners)))
    }
}

fn classify_dual(first: TimeRange, second: TimeRange, window: Option<TimeRange>) -> DualBlock {
    match window {
        Some(w) if w.end <= first.end => DualBlock::First,
        Some(w) if w.start >= second.start => DualBlock::Second,
        _ => DualBlock::Spanning,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use classbook_core::{EntityIdType, ReservationStatus, StudentId, TimeWindows};

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn lesson(classroom_type: ClassroomType, total: u32) -> Lesson {
        Lesson {
            lesson_id: LessonId::now_v7(),
            date: NaiveDate::from_ymd_opt(2025, 9, 6).unwrap(),
            classroom: "Kiln Room".to_string(),
            classroom_type,
            venue: None,
            time_windows: TimeWindows {
                first: TimeRange::new(t(9), t(12)),
                second: TimeRange::new(t(13), t(16)),
                beginner_start: Some(t(10)),
            },
            total_capacity: total,
            beginner_capacity: Some(1),
            reservation_ids: vec![],
        }
    }

    fn booking(lesson: &Lesson, window: Option<(u32, u32)>, first_lecture: bool) -> Reservation {
        Reservation {
            reservation_id: ReservationId::now_v7(),
            lesson_id: lesson.lesson_id,
            student_id: StudentId::now_v7(),
            date: lesson.date,
            classroom: lesson.classroom.clone(),
            start_time: window.map(|(s, _)| t(s)),
            end_time: window.map(|(_, e)| t(e)),
            status: ReservationStatus::Confirmed,
            first_lecture,
            created_at: Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap(),
            notes: None,
            accounting: None,
        }
    }

    fn request(window: Option<(u32, u32)>, first_lecture: bool) -> CapacityRequest {
        CapacityRequest {
            window: window.and_then(|(s, e)| TimeRange::new(t(s), t(e))),
            first_lecture,
            exclude: None,
        }
    }

    #[test]
    fn test_session_based_counts_only_confirmed() {
        let lesson = lesson(ClassroomType::SessionBased, 2);
        let mut waiting = booking(&lesson, None, false);
        waiting.status = ReservationStatus::Waitlisted;
        let mut canceled = booking(&lesson, None, false);
        canceled.status = ReservationStatus::Canceled;
        let rows = vec![booking(&lesson, None, false), waiting, canceled];

        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, false)), 1);

        let full = [rows.clone(), vec![booking(&lesson, None, false)]].concat();
        assert!(CapacityCalculator::is_full(&lesson, &full, &request(None, false)));
    }

    #[test]
    fn test_other_lessons_are_ignored() {
        let lesson = lesson(ClassroomType::SessionBased, 1);
        let other = self::lesson(ClassroomType::SessionBased, 1);
        let rows = vec![booking(&other, None, false)];
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, false)), 1);
    }

    #[test]
    fn test_time_dual_classification() {
        let lesson = lesson(ClassroomType::TimeDual, 2);
        let classify = |w: Option<(u32, u32)>| {
            CapacityCalculator::classify(&lesson, w.and_then(|(s, e)| TimeRange::new(t(s), t(e))))
        };
        assert_eq!(classify(Some((9, 12))), Some(DualBlock::First));
        assert_eq!(classify(Some((10, 11))), Some(DualBlock::First));
        assert_eq!(classify(Some((13, 16))), Some(DualBlock::Second));
        assert_eq!(classify(Some((14, 15))), Some(DualBlock::Second));
        assert_eq!(classify(Some((11, 14))), Some(DualBlock::Spanning));
        assert_eq!(classify(Some((9, 16))), Some(DualBlock::Spanning));
        assert_eq!(classify(None), Some(DualBlock::Spanning));

        let session = self::lesson(ClassroomType::SessionBased, 2);
        assert_eq!(CapacityCalculator::classify(&session, None), None);
    }

    #[test]
    fn test_time_dual_blocks_share_spanning_seats() {
        let lesson = lesson(ClassroomType::TimeDual, 2);
        let rows = vec![
            booking(&lesson, Some((9, 12)), false),
            booking(&lesson, Some((10, 15)), false),
        ];

        // first: 2 - (1 + 1); second: 2 - (0 + 1)
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((9, 12)), false)), 0);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((13, 16)), false)), 1);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((11, 14)), false)), 0);

        let availability = CapacityCalculator::availability(&lesson, &rows);
        assert_eq!(availability.mode, ClassroomType::TimeDual);
        assert_eq!(availability.first_block, Some(0));
        assert_eq!(availability.second_block, Some(1));
        assert!(availability.is_full());
    }

    #[test]
    fn test_time_dual_morning_and_spanning_bookings() {
        let lesson = lesson(ClassroomType::TimeDual, 2);
        let morning = booking(&lesson, Some((9, 11)), false);
        let spanning = booking(&lesson, Some((9, 14)), false);
        assert_eq!(
            CapacityCalculator::classify(&lesson, morning.window()),
            Some(DualBlock::First)
        );
        assert_eq!(
            CapacityCalculator::classify(&lesson, spanning.window()),
            Some(DualBlock::Spanning)
        );

        // 09-11 only draws on the first block.
        let rows = vec![morning];
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((9, 12)), false)), 1);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((13, 16)), false)), 2);

        // 09-14 draws on both, leaving the first block full.
        let rows = [rows, vec![spanning]].concat();
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((9, 12)), false)), 0);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((13, 16)), false)), 1);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((9, 14)), false)), 0);
        assert!(CapacityCalculator::is_full(&lesson, &rows, &request(Some((9, 14)), false)));
        assert!(!CapacityCalculator::is_full(&lesson, &rows, &request(Some((13, 16)), false)));
    }

    #[test]
    fn test_time_dual_without_blocks_falls_back_to_session() {
        let mut lesson = lesson(ClassroomType::TimeDual, 2);
        lesson.time_windows.second = None;
        let rows = vec![booking(&lesson, Some((9, 12)), false)];

        assert_eq!(CapacityCalculator::classify(&lesson, None), None);
        assert_eq!(
            CapacityCalculator::placement(&lesson, &request(Some((13, 16)), false)),
            Placement::Session
        );
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(Some((13, 16)), false)), 1);
        assert_eq!(
            CapacityCalculator::availability(&lesson, &rows).mode,
            ClassroomType::SessionBased
        );
    }

    #[test]
    fn test_time_full_beginner_sub_capacity() {
        let lesson = lesson(ClassroomType::TimeFull, 3);
        let rows = vec![booking(&lesson, None, true)];

        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, true)), 0);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, false)), 2);

        let availability = CapacityCalculator::availability(&lesson, &rows);
        assert_eq!(availability.overall, 2);
        assert_eq!(availability.beginner, Some(0));
    }

    #[test]
    fn test_time_full_beginner_bounded_by_overall() {
        let mut lesson = lesson(ClassroomType::TimeFull, 2);
        lesson.beginner_capacity = Some(5);
        let rows = vec![booking(&lesson, None, false), booking(&lesson, None, false)];
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, true)), 0);

        lesson.beginner_capacity = None;
        let rows = vec![booking(&lesson, None, false)];
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, true)), 1);
    }

    #[test]
    fn test_excluded_reservation_frees_its_seat() {
        let lesson = lesson(ClassroomType::SessionBased, 1);
        let existing = booking(&lesson, None, false);
        let rows = vec![existing.clone()];

        let own = CapacityRequest::for_reservation(&existing).excluding(existing.reservation_id);
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &own), 1);
    }

    #[test]
    fn test_over_booked_lesson_saturates() {
        let lesson = lesson(ClassroomType::SessionBased, 1);
        let rows = vec![booking(&lesson, None, false), booking(&lesson, None, false)];
        assert_eq!(CapacityCalculator::remaining(&lesson, &rows, &request(None, false)), 0);
    }

    #[test]
    fn test_placement_covers() {
        let spanning = Placement::Dual(DualBlock::Spanning);
        assert!(spanning.covers(&Placement::Dual(DualBlock::First)));
        assert!(!Placement::Dual(DualBlock::First).covers(&spanning));
        assert!(Placement::Full { beginner: true }.covers(&Placement::Full { beginner: false }));
        assert!(!Placement::Full { beginner: false }.covers(&Placement::Full { beginner: true }));
        assert!(Placement::Session.covers(&Placement::Session));
    }
}
