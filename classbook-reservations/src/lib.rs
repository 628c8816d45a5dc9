//! Classbook Reservations - Serialized Booking Transactions
//!
//! Reservation mutations run one at a time under a process-wide lock:
//! - [`LockManager`] / [`MutexPrimitive`]: bounded-wait mutual exclusion
//! - [`CapacityCalculator`]: remaining seats per classroom mode
//! - [`ReservationTransactionManager`]: create, cancel, update, confirm, complete
//! - [`WaitlistNotifier`]: waitlist selection once a seat is freed
//!
//! Reads go straight to the versioned cache and are never serialized.

pub mod capacity;
pub mod mutex;
pub mod notify;
pub mod transaction;
pub mod waitlist;

pub use capacity::{Availability, CapacityCalculator, CapacityRequest, DualBlock, Placement};
pub use mutex::{InProcessMutex, LockGuard, LockManager, MutexPrimitive, RESERVATION_RESOURCE};
pub use notify::{
    ChannelNotificationSink, LoggingNotificationSink, NotificationSink, NotifyError,
    WaitlistNotification,
};
pub use transaction::{
    Cancellation, Committed, NewReservation, ReservationTransactionManager, ReservationUpdate,
    TransactionState,
};
pub use waitlist::WaitlistNotifier;
