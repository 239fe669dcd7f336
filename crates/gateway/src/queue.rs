//! Global concurrency cap with a bounded wait queue.
//!
//! Requests past the concurrent cap wait in line for a slot; once the
//! line itself is full, further arrivals fail fast with
//! `capacity_exceeded`. Waiters observe the request deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use llmrouter_core::error::{GatewayError, Result};

pub struct DispatchQueue {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
}

impl DispatchQueue {
    pub fn new(max_concurrent: usize, queue_depth: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            waiting: AtomicUsize::new(0),
            queue_depth,
        }
    }

    /// Acquire a dispatch slot before `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> Result<OwnedSemaphorePermit> {
        // Fast path: a slot is free right now
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        // Slow path: join the bounded wait queue
        let waiting = self.waiting.fetch_add(1, Ordering::AcqRel);
        if waiting >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(GatewayError::CapacityExceeded {
                retry_after_ms: 1_000,
            });
        }

        let result = tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            self.semaphore.clone().acquire_owned(),
        )
        .await;
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(GatewayError::Internal("dispatch queue closed".into())),
            Err(_) => Err(GatewayError::CapacityExceeded {
                retry_after_ms: 1_000,
            }),
        }
    }

    /// Current wait-queue length, for the admin surface.
    pub fn depth(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn grants_up_to_capacity() {
        let queue = DispatchQueue::new(2, 1);
        let p1 = queue.acquire(deadline_in(50)).await.unwrap();
        let _p2 = queue.acquire(deadline_in(50)).await.unwrap();
        assert_eq!(queue.available_slots(), 0);

        drop(p1);
        let _p3 = queue.acquire(deadline_in(50)).await.unwrap();
    }

    #[tokio::test]
    async fn queue_overflow_fails_fast() {
        let queue = Arc::new(DispatchQueue::new(1, 1));
        let _held = queue.acquire(deadline_in(1_000)).await.unwrap();

        // One waiter fits in the queue
        let q2 = queue.clone();
        let waiter = tokio::spawn(async move { q2.acquire(deadline_in(500)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.depth(), 1);

        // The next arrival overflows immediately
        let err = queue.acquire(deadline_in(500)).await.unwrap_err();
        assert_eq!(err.kind(), "capacity_exceeded");

        drop(_held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn waiter_times_out_at_deadline() {
        let queue = DispatchQueue::new(1, 5);
        let _held = queue.acquire(deadline_in(1_000)).await.unwrap();

        let started = Instant::now();
        let err = queue.acquire(deadline_in(50)).await.unwrap_err();
        assert_eq!(err.kind(), "capacity_exceeded");
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(queue.depth(), 0);
    }
}
