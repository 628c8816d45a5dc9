//! Classbook Core - Entity Types
//!
//! Pure data structures shared by every other crate: identifiers, enums,
//! entities, positional row schemas, errors, configuration and the lock
//! typestate. No I/O lives here.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod lock;
pub mod schema;

pub use config::{BookingSettings, CacheSettings, ClassbookConfig};
pub use entities::{
    AccountingDetails, AccountingLine, AccountingMasterItem, Lesson, Reservation, Student,
    TimeRange, TimeWindows,
};
pub use enums::{ClassroomType, DatasetKind, ReservationStatus, ReservationStatusParseError};
pub use error::{
    BookingError, CacheError, ClassbookError, ClassbookResult, ConfigError, SchemaError,
    StorageError,
};
pub use identity::{EntityIdType, LessonId, ReservationId, StudentId, Timestamp};
pub use lock::{Acquired, Lock, LockData, LockState, Released};
pub use schema::{
    Decoded, HeaderIndex, Record, RejectedRow, RowSet, StatusRecord, DATE_FORMAT, TIME_FORMAT,
};
