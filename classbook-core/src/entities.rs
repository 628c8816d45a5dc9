//! Core entity structures

use crate::{ClassroomType, LessonId, ReservationId, ReservationStatus, StudentId, Timestamp};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// TIME WINDOWS
// ============================================================================

/// Half-open time range `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Returns `None` unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Time structure of a lesson, as configured in the schedule dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindows {
    /// Morning block for TimeDual, whole day for TimeFull
    pub first: Option<TimeRange>,
    /// Afternoon block for TimeDual
    pub second: Option<TimeRange>,
    /// Start time of the beginner (first lecture) slot
    pub beginner_start: Option<NaiveTime>,
}

impl TimeWindows {
    /// Both blocks of a TimeDual lesson, if they are present and ordered.
    pub fn dual_blocks(&self) -> Option<(TimeRange, TimeRange)> {
        match (self.first, self.second) {
            (Some(first), Some(second)) if first.end <= second.start => Some((first, second)),
            _ => None,
        }
    }
}

// ============================================================================
// SCHEDULE
// ============================================================================

/// One scheduled class instance (date + classroom).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub lesson_id: LessonId,
    pub date: NaiveDate,
    pub classroom: String,
    pub classroom_type: ClassroomType,
    pub venue: Option<String>,
    pub time_windows: TimeWindows,
    pub total_capacity: u32,
    pub beginner_capacity: Option<u32>,
    /// Every reservation ever made against this lesson, in booking order and
    /// whatever its status. Append-only; synced after each create.
    pub reservation_ids: Vec<ReservationId>,
}

impl Lesson {
    /// Add a reservation to the back-reference list. Returns false if already present.
    pub fn link_reservation(&mut self, reservation_id: ReservationId) -> bool {
        if self.reservation_ids.contains(&reservation_id) {
            return false;
        }
        self.reservation_ids.push(reservation_id);
        true
    }
}

// ============================================================================
// RESERVATIONS
// ============================================================================

/// One student's booking against a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub lesson_id: LessonId,
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub classroom: String,
    /// Requested start; absent for session-based bookings
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub status: ReservationStatus,
    /// Beginner booking, counted against the beginner sub-capacity
    pub first_lecture: bool,
    pub created_at: Timestamp,
    pub notes: Option<String>,
    pub accounting: Option<AccountingDetails>,
}

impl Reservation {
    /// Requested window, when both times are present and ordered.
    pub fn window(&self) -> Option<TimeRange> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => TimeRange::new(start, end),
            _ => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status.occupies_seat()
    }
}

// ============================================================================
// ROSTER
// ============================================================================

/// A student in the roster dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: StudentId,
    pub name: String,
    /// Contact reference (email or phone) handed to notification delivery
    pub contact: Option<String>,
}

// ============================================================================
// ACCOUNTING
// ============================================================================

/// One billable item in the accounting-master dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingMasterItem {
    pub item_code: String,
    pub item_name: String,
    /// Price in the smallest currency unit
    pub unit_price: u64,
    /// Free-form grouping, e.g. "tuition", "material", "sales"
    pub item_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingLine {
    pub item_code: String,
    pub quantity: u32,
}

/// Accounting attached to a reservation on completion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountingDetails {
    pub items: Vec<AccountingLine>,
    pub total: u64,
}
