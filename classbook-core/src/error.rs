//! Error types for Classbook operations
//!
//! Errors split into two classes:
//! - validation failures ([`BookingError`]) that are returned to the caller
//!   as structured rejections, and
//! - infrastructure failures ([`StorageError`], [`CacheError`], [`SchemaError`],
//!   [`ConfigError`]).
//!
//! Cache misses and missing chunks are not errors at all; they are reported as
//! a miss and recovered by a rebuild.

use crate::{DatasetKind, LessonId, ReservationId, ReservationStatus, StudentId};
use chrono::NaiveDate;
use thiserror::Error;

/// Row store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Row store write failed for {dataset}: {reason}")]
    WriteFailed { dataset: DatasetKind, reason: String },

    #[error("Row store scan failed for {dataset}: {reason}")]
    ScanFailed { dataset: DatasetKind, reason: String },

    #[error("Row {row_id} not found in {dataset}")]
    RowNotFound { dataset: DatasetKind, row_id: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Dataset {key} needs {required} chunks, limit is {max}")]
    ChunkLimitExceeded {
        key: String,
        required: usize,
        max: usize,
    },

    #[error("Row {row_index} of {key} is {size_bytes} bytes, larger than the {limit_bytes} byte entry limit")]
    RowTooLarge {
        key: String,
        row_index: usize,
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Entry {key} is {size_bytes} bytes, medium ceiling is {ceiling_bytes}")]
    EntryTooLarge {
        key: String,
        size_bytes: usize,
        ceiling_bytes: usize,
    },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Cache backend error: {reason}")]
    Backend { reason: String },
}

/// Positional row decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Header of {dataset} is missing required column {column}")]
    MissingColumn { dataset: DatasetKind, column: String },

    #[error("Invalid value {value:?} in {dataset}.{column}: {reason}")]
    InvalidCell {
        dataset: DatasetKind,
        column: String,
        value: String,
        reason: String,
    },

    #[error("Unknown column {column} for {dataset}")]
    UnknownColumn { dataset: DatasetKind, column: String },
}

/// Reservation validation failures.
///
/// These are user-visible rejections; none of them leaves a partial write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookingError {
    #[error("Reservation lock not acquired within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("Lesson {lesson_id} has no capacity left for the requested window")]
    CapacityExceeded { lesson_id: LessonId },

    #[error("Student {student_id} already has confirmed reservation {existing} on {date}")]
    DuplicateBooking {
        student_id: StudentId,
        date: NaiveDate,
        existing: ReservationId,
    },

    #[error("Reservation {reservation_id} is already {status}")]
    AlreadyFinal {
        reservation_id: ReservationId,
        status: ReservationStatus,
    },

    #[error("Cannot {action} reservation {reservation_id} in status {from}")]
    InvalidTransition {
        reservation_id: ReservationId,
        from: ReservationStatus,
        action: String,
    },

    #[error("Lesson not found: {lesson_id}")]
    LessonNotFound { lesson_id: LessonId },

    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: ReservationId },

    #[error("Invalid accounting details for {reservation_id}: {reason}")]
    InvalidAccounting {
        reservation_id: ReservationId,
        reason: String,
    },
}

impl BookingError {
    /// Only lock contention is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::LockTimeout { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Classbook errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassbookError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Booking rejected: {0}")]
    Booking(#[from] BookingError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ClassbookError {
    /// Returns the booking rejection, if this is one.
    pub fn as_booking(&self) -> Option<&BookingError> {
        match self {
            ClassbookError::Booking(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for Classbook operations.
pub type ClassbookResult<T> = Result<T, ClassbookError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_storage_error_display_write_failed() {
        let err = StorageError::WriteFailed {
            dataset: DatasetKind::Reservations,
            reason: "quota exceeded".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("write failed"));
        assert!(msg.contains("reservations"));
        assert!(msg.contains("quota exceeded"));
    }

    #[test]
    fn test_cache_error_display_chunk_limit() {
        let err = CacheError::ChunkLimitExceeded {
            key: "classbook:reservations".to_string(),
            required: 23,
            max: 20,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("23"));
        assert!(msg.contains("20"));
    }

    #[test]
    fn test_booking_error_display_duplicate() {
        let err = BookingError::DuplicateBooking {
            student_id: StudentId::nil(),
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            existing: ReservationId::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("already has confirmed reservation"));
        assert!(msg.contains("2025-03-14"));
    }

    #[test]
    fn test_only_lock_timeout_is_retryable() {
        assert!(BookingError::LockTimeout { waited_ms: 30_000 }.is_retryable());
        assert!(!BookingError::CapacityExceeded {
            lesson_id: LessonId::nil()
        }
        .is_retryable());
    }

    #[test]
    fn test_classbook_error_from_variants() {
        let storage = ClassbookError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, ClassbookError::Storage(_)));

        let cache = ClassbookError::from(CacheError::Backend {
            reason: "closed".to_string(),
        });
        assert!(matches!(cache, ClassbookError::Cache(_)));

        let schema = ClassbookError::from(SchemaError::UnknownColumn {
            dataset: DatasetKind::Roster,
            column: "nickname".to_string(),
        });
        assert!(matches!(schema, ClassbookError::Schema(_)));

        let booking = ClassbookError::from(BookingError::LockTimeout { waited_ms: 5 });
        assert!(booking.as_booking().is_some());

        let config = ClassbookError::from(ConfigError::Parse {
            reason: "eof".to_string(),
        });
        assert!(matches!(config, ClassbookError::Config(_)));
        assert!(config.as_booking().is_none());
    }
}
