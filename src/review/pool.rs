//! Process-wide bounded pool for outbound capability calls.
//!
//! One pool throttles every concurrent submission so the external
//! analysis service sees a bounded call rate. Admission is FIFO-fair
//! (tokio's semaphore queues waiters in arrival order) and bounded by
//! a queueing timeout: a submission that cannot get its slots in time
//! fails `Busy` instead of blocking indefinitely.

use crate::review::types::ReviewError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct CapabilityPool {
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
    capacity: usize,
}

impl CapabilityPool {
    pub fn new(capacity: usize, queue_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            queue_timeout,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire `slots` permits atomically, or fail `Busy` after the
    /// queueing timeout. Atomic acquisition means a submission never
    /// holds a partial set of slots, so two queued submissions cannot
    /// deadlock each other.
    pub async fn admit(&self, slots: u32) -> Result<OwnedSemaphorePermit, ReviewError> {
        let acquire = Arc::clone(&self.semaphore).acquire_many_owned(slots);
        match tokio::time::timeout(self.queue_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            // Closed semaphore cannot happen (we never close it), but
            // map it to Busy rather than panicking.
            Ok(Err(_)) => Err(ReviewError::Busy),
            Err(_) => Err(ReviewError::Busy),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_within_capacity() {
        let pool = CapabilityPool::new(8, Duration::from_millis(50));
        let first = pool.admit(4).await.unwrap();
        let second = pool.admit(4).await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(first);
        drop(second);
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_fails_busy_after_queue_timeout() {
        let pool = CapabilityPool::new(4, Duration::from_secs(1));
        let _held = pool.admit(4).await.unwrap();
        let err = pool.admit(4).await.unwrap_err();
        assert!(matches!(err, ReviewError::Busy));
    }

    #[tokio::test]
    async fn released_slots_admit_the_waiter() {
        let pool = Arc::new(CapabilityPool::new(4, Duration::from_secs(5)));
        let held = pool.admit(4).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.admit(4).await.map(drop) })
        };

        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fifo_order_between_waiters() {
        let pool = Arc::new(CapabilityPool::new(1, Duration::from_secs(5)));
        let held = pool.admit(1).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u8>();
        for tag in [1u8, 2, 3] {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = pool.admit(1).await.unwrap();
                let _ = tx.send(tag);
                drop(permit);
            });
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(held);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![1, 2, 3]);
    }
}
