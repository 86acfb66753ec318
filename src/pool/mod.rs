//! Bounded resource pool: a semaphore-backed FIFO waiter queue for scarce external
//! connections (streaming STT primarily; the same pool type is reused for TTS leases and
//! webhook admission — see module docs on [`crate::pool::PoolKind`]).
//!
//! Grounded in the connection-pool shape seen in the wider corpus (round-robin connection
//! pooling with bounded capacity and reconnect backoff) but reworked around `tokio::sync::Semaphore`,
//! whose `acquire` is itself FIFO, plus an explicit waiter-count gate so overflow can be
//! rejected before ever touching the semaphore (`PoolExhausted` vs `AcquireTimeout`, §4.1).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Named resource kinds the pool is leased for: STT is the primary driver, with TTS and
/// inbound webhook admission reusing the identical pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Stt,
    Tts,
    WebhookAdmission,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: queue is full")]
    PoolExhausted,
    #[error("acquire timed out after {0:?}")]
    AcquireTimeout(Duration),
    #[error("owner {0} already holds a lease from this pool")]
    DoubleAcquire(String),
    #[error("pool is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub queue_depth: usize,
    pub capacity: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_timed_out: u64,
    pub total_failed: u64,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.active as f64 / self.capacity as f64
        }
    }
}

struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    queue_depth: AtomicUsize,
}

/// A bounded pool of capacity `N` with a FIFO waiter queue capped at `max_queue_size`.
pub struct ResourcePool {
    kind: PoolKind,
    capacity: usize,
    max_queue_size: usize,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    active_owners: DashSet<String>,
    counters: Counters,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl ResourcePool {
    pub fn new(kind: PoolKind, capacity: usize, max_queue_size: usize, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            capacity,
            max_queue_size,
            acquire_timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            active_owners: DashSet::new(),
            counters: Counters {
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                queue_depth: AtomicUsize::new(0),
            },
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Acquire a lease for `owner_id`. Returns `PoolExhausted` only when the waiter queue
    /// is already at capacity; otherwise waits up to `acquire_timeout` before returning
    /// `AcquireTimeout` (§4.1).
    pub async fn acquire(self: &Arc<Self>, owner_id: impl Into<String>) -> Result<PoolLease, PoolError> {
        let owner_id = owner_id.into();

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }
        if !self.active_owners.insert(owner_id.clone()) {
            return Err(PoolError::DoubleAcquire(owner_id));
        }

        // Fast path: a permit is immediately available, never touches the queue.
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            return Ok(PoolLease::new(self.clone(), owner_id, permit));
        }

        let queue_depth = self.counters.queue_depth.fetch_add(1, Ordering::AcqRel) + 1;
        if queue_depth > self.max_queue_size {
            self.counters.queue_depth.fetch_sub(1, Ordering::AcqRel);
            self.active_owners.remove(&owner_id);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::PoolExhausted);
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown_notify.notified() => {
                Err(PoolError::ShuttingDown)
            }
            permit = tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned()) => {
                match permit {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(PoolError::ShuttingDown),
                    Err(_) => Err(PoolError::AcquireTimeout(self.acquire_timeout)),
                }
            }
        };

        self.counters.queue_depth.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(permit) => {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(PoolLease::new(self.clone(), owner_id, permit))
            }
            Err(err) => {
                self.active_owners.remove(&owner_id);
                match &err {
                    PoolError::AcquireTimeout(_) => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err)
            }
        }
    }

    /// Release is called from [`PoolLease::drop`]/[`PoolLease::release`] and is idempotent
    /// by construction (the permit is consumed on first release).
    fn on_release(&self, owner_id: &str) {
        self.active_owners.remove(owner_id);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.capacity - self.semaphore.available_permits(),
            queue_depth: self.counters.queue_depth.load(Ordering::Relaxed),
            capacity: self.capacity,
            total_acquired: self.counters.acquired.load(Ordering::Relaxed),
            total_released: self.counters.released.load(Ordering::Relaxed),
            total_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Reject new acquires, wake every waiter with `ShuttingDown`, and wait up to `grace`
    /// for outstanding leases to drain before returning.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        while self.semaphore.available_permits() < self.capacity && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// A held lease. Dropping it (or calling [`PoolLease::release`] explicitly) returns the
/// permit to the pool. Releasing twice is a no-op.
pub struct PoolLease {
    pool: Arc<ResourcePool>,
    owner_id: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolLease {
    fn new(pool: Arc<ResourcePool>, owner_id: String, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            owner_id,
            permit: Some(permit),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Idempotent explicit release; a lease not currently held (already released) is a
    /// no-op per §4.1.
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            self.pool.on_release(&self.owner_id);
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_updates_stats() {
        let pool = ResourcePool::new(PoolKind::Stt, 2, 5, Duration::from_millis(100));
        let lease = pool.acquire("session-1").await.unwrap();
        assert_eq!(pool.stats().active, 1);
        drop(lease);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().total_released, 1);
    }

    #[tokio::test]
    async fn double_acquire_by_same_owner_rejected() {
        let pool = ResourcePool::new(PoolKind::Stt, 2, 5, Duration::from_millis(100));
        let _lease = pool.acquire("session-1").await.unwrap();
        let err = pool.acquire("session-1").await.unwrap_err();
        assert!(matches!(err, PoolError::DoubleAcquire(_)));
    }

    #[tokio::test]
    async fn queue_full_returns_pool_exhausted_not_timeout() {
        let pool = ResourcePool::new(PoolKind::Stt, 1, 0, Duration::from_millis(50));
        let _lease = pool.acquire("owner-a").await.unwrap();
        let err = pool.acquire("owner-b").await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted));
    }

    #[tokio::test]
    async fn waiter_within_queue_depth_times_out_when_not_freed() {
        let pool = ResourcePool::new(PoolKind::Stt, 1, 5, Duration::from_millis(50));
        let _lease = pool.acquire("owner-a").await.unwrap();
        let err = pool.acquire("owner-b").await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
    }

    #[tokio::test]
    async fn waiter_proceeds_once_capacity_frees_up() {
        let pool = ResourcePool::new(PoolKind::Stt, 1, 5, Duration::from_secs(2));
        let lease_a = pool.acquire("owner-a").await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("owner-b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease_a);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_with_shutting_down() {
        let pool = ResourcePool::new(PoolKind::Stt, 1, 5, Duration::from_secs(5));
        let _lease = pool.acquire("owner-a").await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("owner-b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown(Duration::from_millis(10)).await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::ShuttingDown)));
    }
}
