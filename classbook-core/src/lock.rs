//! Lock typestate for the reservation mutex.
//!
//! A lease can only be released while it is in the `Acquired` state, and
//! releasing consumes it, so a lease cannot be released twice.
//!
//! ```text
//! (unlocked) ─── acquire() ──→ Acquired ─── release() ──→ (unlocked)
//! ```

use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// LOCK DATA
// ============================================================================

/// Lease record of one mutex acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    pub lock_id: Uuid,
    /// Name of the guarded resource, e.g. `"reservations"`
    pub resource: String,
    /// Operation that holds the lock, e.g. `"create_reservation"`
    pub holder: String,
    pub acquired_at: Timestamp,
    /// Soft deadline; holding past it is logged, not enforced
    pub expires_at: Timestamp,
}

impl LockData {
    /// Start a lease that expires `lease` from now.
    pub fn start(resource: impl Into<String>, holder: impl Into<String>, lease: Duration) -> Self {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        Self {
            lock_id: Uuid::now_v7(),
            resource: resource.into(),
            holder: holder.into(),
            acquired_at: now,
            expires_at: now.checked_add_signed(lease).unwrap_or(now),
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// How long the lease has been held as of `now`.
    pub fn held_for(&self, now: Timestamp) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

/// Lock has been released (locks in this state don't exist at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LockState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A lease with compile-time state tracking.
#[derive(Debug)]
pub struct Lock<S: LockState> {
    data: LockData,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn lock_id(&self) -> Uuid {
        self.data.lock_id
    }

    pub fn resource(&self) -> &str {
        &self.data.resource
    }

    pub fn holder(&self) -> &str {
        &self.data.holder
    }
}

impl Lock<Acquired> {
    /// Wrap lease data after a successful acquisition.
    pub fn new(data: LockData) -> Self {
        Lock {
            data,
            _state: PhantomData,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    pub fn held_for(&self, now: Timestamp) -> Duration {
        self.data.held_for(now)
    }

    /// Release the lease and return its data. Consumes the lock.
    pub fn release(self) -> LockData {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let data = LockData::start("reservations", "create_reservation", Duration::from_secs(30));
        assert!(!data.is_expired(data.acquired_at));
        assert!(data.is_expired(data.acquired_at + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_held_for_never_negative() {
        let data = LockData::start("reservations", "cancel_reservation", Duration::from_secs(1));
        let earlier = data.acquired_at - chrono::Duration::seconds(5);
        assert_eq!(data.held_for(earlier), Duration::ZERO);
        let later = data.acquired_at + chrono::Duration::milliseconds(250);
        assert_eq!(data.held_for(later), Duration::from_millis(250));
    }

    #[test]
    fn test_lock_release_consumes() {
        let data = LockData::start("reservations", "create_reservation", Duration::from_secs(30));
        let lock = Lock::<Acquired>::new(data.clone());
        assert_eq!(lock.resource(), "reservations");
        assert_eq!(lock.holder(), "create_reservation");

        let released = lock.release();
        assert_eq!(released.lock_id, data.lock_id);
    }

    #[test]
    fn test_huge_lease_does_not_overflow() {
        let data = LockData::start("reservations", "test", Duration::from_secs(u64::MAX));
        assert!(data.expires_at >= data.acquired_at);
    }
}
