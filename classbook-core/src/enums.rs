//! Enum types for Classbook entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Normalize a cell value for lenient enum parsing.
///
/// Spreadsheet cells are typed by hand, so `"Session Based"`, `"session_based"`
/// and `"SESSION-BASED"` all resolve to the same token.
fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ============================================================================
// RESERVATION STATUS
// ============================================================================

/// Lifecycle status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Holds a seat in the lesson
    Confirmed,
    /// Recorded against a full lesson, eligible for promotion
    Waitlisted,
    /// Attended and settled; terminal for cache purposes
    Completed,
    /// Canceled by the student or the studio; terminal
    Canceled,
}

impl ReservationStatus {
    /// Convert to row-store string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "Confirmed",
            ReservationStatus::Waitlisted => "Waitlisted",
            ReservationStatus::Completed => "Completed",
            ReservationStatus::Canceled => "Canceled",
        }
    }

    /// Parse from row-store string representation.
    pub fn from_db_str(s: &str) -> Result<Self, ReservationStatusParseError> {
        match normalize_token(s).as_str() {
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "waitlisted" | "waiting" => Ok(ReservationStatus::Waitlisted),
            "completed" | "complete" => Ok(ReservationStatus::Completed),
            "canceled" | "cancelled" => Ok(ReservationStatus::Canceled),
            _ => Err(ReservationStatusParseError(s.to_string())),
        }
    }

    /// Terminal states can never transition again.
    pub fn is_final(&self) -> bool {
        matches!(self, ReservationStatus::Canceled | ReservationStatus::Completed)
    }

    /// Whether this status occupies a seat for capacity purposes.
    pub fn occupies_seat(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ReservationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid reservation status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationStatusParseError(pub String);

impl fmt::Display for ReservationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid reservation status: {}", self.0)
    }
}

impl std::error::Error for ReservationStatusParseError {}

// ============================================================================
// CLASSROOM TYPE
// ============================================================================

/// Capacity-accounting mode of a classroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ClassroomType {
    /// One shared capacity pool for the whole session
    #[default]
    SessionBased,
    /// Two independent time blocks (e.g. morning and afternoon)
    TimeDual,
    /// One all-day window with a beginner sub-capacity
    TimeFull,
}

impl fmt::Display for ClassroomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ClassroomType::SessionBased => "SessionBased",
            ClassroomType::TimeDual => "TimeDual",
            ClassroomType::TimeFull => "TimeFull",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for ClassroomType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "sessionbased" | "session" => Ok(ClassroomType::SessionBased),
            "timedual" | "dual" => Ok(ClassroomType::TimeDual),
            "timefull" | "fullday" => Ok(ClassroomType::TimeFull),
            _ => Err(format!("Invalid ClassroomType: {}", s)),
        }
    }
}

// ============================================================================
// DATASET KIND
// ============================================================================

/// Logical datasets mirrored from the row store into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatasetKind {
    Reservations,
    Schedule,
    AccountingMaster,
    Roster,
}

impl DatasetKind {
    /// Every dataset, in a stable order.
    pub const ALL: [DatasetKind; 4] = [
        DatasetKind::Reservations,
        DatasetKind::Schedule,
        DatasetKind::AccountingMaster,
        DatasetKind::Roster,
    ];

    /// Cache key under which the dataset's metadata entry is stored.
    pub fn cache_key(&self) -> &'static str {
        match self {
            DatasetKind::Reservations => "classbook:reservations",
            DatasetKind::Schedule => "classbook:schedule",
            DatasetKind::AccountingMaster => "classbook:accounting-master",
            DatasetKind::Roster => "classbook:roster",
        }
    }

    /// Table name in the row store.
    pub fn table_name(&self) -> &'static str {
        match self {
            DatasetKind::Reservations => "reservations",
            DatasetKind::Schedule => "schedule",
            DatasetKind::AccountingMaster => "accounting_master",
            DatasetKind::Roster => "roster",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "reservations" | "reservation" => Ok(DatasetKind::Reservations),
            "schedule" | "lessons" => Ok(DatasetKind::Schedule),
            "accountingmaster" => Ok(DatasetKind::AccountingMaster),
            "roster" | "students" => Ok(DatasetKind::Roster),
            _ => Err(format!("Invalid DatasetKind: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_status_roundtrip() {
        for status in [
            ReservationStatus::Confirmed,
            ReservationStatus::Waitlisted,
            ReservationStatus::Completed,
            ReservationStatus::Canceled,
        ] {
            let parsed = ReservationStatus::from_db_str(status.as_db_str()).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_reservation_status_accepts_british_spelling() {
        assert_eq!(
            "Cancelled".parse::<ReservationStatus>().unwrap(),
            ReservationStatus::Canceled
        );
    }

    #[test]
    fn test_final_states() {
        assert!(ReservationStatus::Canceled.is_final());
        assert!(ReservationStatus::Completed.is_final());
        assert!(!ReservationStatus::Confirmed.is_final());
        assert!(!ReservationStatus::Waitlisted.is_final());
    }

    #[test]
    fn test_classroom_type_lenient_parse() {
        assert_eq!(
            "session_based".parse::<ClassroomType>().unwrap(),
            ClassroomType::SessionBased
        );
        assert_eq!("Time Dual".parse::<ClassroomType>().unwrap(), ClassroomType::TimeDual);
        assert_eq!("TIME-FULL".parse::<ClassroomType>().unwrap(), ClassroomType::TimeFull);
        assert!("hourly".parse::<ClassroomType>().is_err());
    }

    #[test]
    fn test_dataset_keys_are_distinct() {
        let keys: std::collections::HashSet<_> =
            DatasetKind::ALL.iter().map(|d| d.cache_key()).collect();
        assert_eq!(keys.len(), DatasetKind::ALL.len());
    }
}
