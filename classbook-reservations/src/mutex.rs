//! Process-wide mutual exclusion for reservation mutations.
//!
//! Every create, cancel and update runs while holding the single reservation
//! lock. Waiting is bounded; a caller that cannot acquire the lock within the
//! configured timeout gets [`BookingError::LockTimeout`] and nothing is written.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use classbook_core::{Acquired, BookingError, ClassbookConfig, ClassbookResult, Lock, LockData};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Resource name recorded on every lease.
pub const RESERVATION_RESOURCE: &str = "reservations";

// ============================================================================
// PRIMITIVE
// ============================================================================

/// Wait-with-timeout mutual exclusion.
#[async_trait]
pub trait MutexPrimitive: Send + Sync {
    /// Wait up to `timeout` for the lock. Returns false on timeout.
    async fn try_acquire(&self, timeout: Duration) -> bool;

    /// Release a lock obtained from [`MutexPrimitive::try_acquire`].
    fn release(&self);
}

/// Single-permit semaphore, local to this process.
#[derive(Debug)]
pub struct InProcessMutex {
    permits: Semaphore,
}

impl InProcessMutex {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for InProcessMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MutexPrimitive for InProcessMutex {
    async fn try_acquire(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                // Returned explicitly through `release`.
                permit.forget();
                true
            }
            Ok(Err(_)) | Err(_) => false,
        }
    }

    fn release(&self) {
        if self.is_held() {
            self.permits.add_permits(1);
        } else {
            warn!("Release called on an unheld reservation mutex; ignoring");
        }
    }
}

// ============================================================================
// LOCK MANAGER
// ============================================================================

/// Hands out RAII guards over a [`MutexPrimitive`].
pub struct LockManager {
    primitive: Arc<dyn MutexPrimitive>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(primitive: Arc<dyn MutexPrimitive>, timeout: Duration) -> Self {
        Self { primitive, timeout }
    }

    /// Lock manager over a fresh [`InProcessMutex`] with the configured timeout.
    pub fn in_process(config: &ClassbookConfig) -> Self {
        Self::new(Arc::new(InProcessMutex::new()), config.lock_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the reservation lock on behalf of `holder`.
    pub async fn acquire(&self, holder: &str) -> ClassbookResult<LockGuard> {
        let started = Instant::now();
        if !self.primitive.try_acquire(self.timeout).await {
            let waited_ms = started.elapsed().as_millis() as u64;
            warn!(holder, waited_ms, "Timed out waiting for the reservation lock");
            return Err(BookingError::LockTimeout { waited_ms }.into());
        }

        let lock = Lock::new(LockData::start(RESERVATION_RESOURCE, holder, self.timeout));
        debug!(
            holder,
            lock_id = %lock.lock_id(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Reservation lock acquired"
        );
        Ok(LockGuard {
            lock: Some(lock),
            primitive: self.primitive.clone(),
        })
    }
}

/// Holds the reservation lock until released or dropped.
pub struct LockGuard {
    lock: Option<Lock<Acquired>>,
    primitive: Arc<dyn MutexPrimitive>,
}

impl LockGuard {
    pub fn data(&self) -> Option<&LockData> {
        self.lock.as_ref().map(Lock::data)
    }

    /// Release now and return the lease record.
    pub fn release(mut self) -> Option<LockData> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Option<LockData> {
        let lock = self.lock.take()?;
        let now = Utc::now();
        let held_ms = lock.held_for(now).as_millis() as u64;
        if lock.is_expired(now) {
            warn!(
                holder = lock.holder(),
                lock_id = %lock.lock_id(),
                held_ms,
                "Reservation lock held past its lease"
            );
        }
        let data = lock.release();
        self.primitive.release();
        debug!(holder = %data.holder, lock_id = %data.lock_id, held_ms, "Reservation lock released");
        Some(data)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout_ms: u64) -> (LockManager, Arc<InProcessMutex>) {
        let mutex = Arc::new(InProcessMutex::new());
        let manager = LockManager::new(mutex.clone(), Duration::from_millis(timeout_ms));
        (manager, mutex)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (manager, mutex) = manager(50);
        let guard = manager.acquire("create_reservation").await.unwrap();
        assert!(mutex.is_held());
        assert_eq!(guard.data().unwrap().resource, RESERVATION_RESOURCE);

        let data = guard.release().unwrap();
        assert_eq!(data.holder, "create_reservation");
        assert!(!mutex.is_held());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let (manager, _mutex) = manager(20);
        let _held = manager.acquire("first").await.unwrap();

        let err = manager.acquire("second").await.err().unwrap();
        let booking = err.as_booking().unwrap();
        assert!(matches!(booking, BookingError::LockTimeout { waited_ms } if *waited_ms >= 20));
        assert!(booking.is_retryable());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let (manager, mutex) = manager(20);
        {
            let _guard = manager.acquire("scoped").await.unwrap();
            assert!(mutex.is_held());
        }
        assert!(!mutex.is_held());
        assert!(manager.acquire("after").await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let (manager, _mutex) = manager(1_000);
        let manager = Arc::new(manager);
        let guard = manager.acquire("holder").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("waiter").await.map(|g| g.release()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let released = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(released.holder, "waiter");
    }

    #[test]
    fn test_release_of_unheld_mutex_is_ignored() {
        let mutex = InProcessMutex::new();
        mutex.release();
        assert_eq!(mutex.permits.available_permits(), 1);
    }
}
