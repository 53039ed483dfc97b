//! FIFO admission to the single engine.
//!
//! The engine runs one graph at a time. Requests beyond the first wait on a
//! fair semaphore with a single permit, so they are admitted in arrival order.
//! Closing the serializer turns every current and future wait into `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Single-slot, first-come-first-served gate in front of the engine.
#[derive(Debug, Clone)]
pub struct RequestSerializer {
    slot: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// Exclusive use of the engine; released on drop.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

impl Default for RequestSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSerializer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of requests currently queued behind the slot.
    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Stop admitting requests. Waiters are woken and get `None`.
    pub fn close(&self) {
        self.slot.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Wait for the slot; `None` once the serializer is closed.
    pub async fn acquire(&self) -> Option<ExecutionSlot> {
        let depth = self.waiting.fetch_add(1, Ordering::Relaxed);
        let queued = Queued(&self.waiting);
        if depth > 0 || self.slot.available_permits() == 0 {
            tracing::debug!(queued_ahead = depth, "Waiting for engine slot");
        }
        let permit = Arc::clone(&self.slot).acquire_owned().await;
        drop(queued);

        permit.ok().map(|permit| ExecutionSlot { _permit: permit })
    }
}

/// Decrements the queue counter even if the waiting future is dropped.
struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn only_one_slot_at_a_time() {
        let serializer = RequestSerializer::new();
        let held = serializer.acquire().await.unwrap();

        let second = tokio::time::timeout(Duration::from_millis(50), serializer.acquire()).await;
        assert!(second.is_err(), "second acquire should block");

        drop(held);
        tokio::time::timeout(Duration::from_millis(500), serializer.acquire())
            .await
            .expect("slot should be free after release")
            .unwrap();
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let serializer = RequestSerializer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = serializer.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let serializer = serializer.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = serializer.acquire().await.unwrap();
                order.lock().await.push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(serializer.queue_depth(), 4);

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
        assert_eq!(serializer.queue_depth(), 0);
    }

    #[tokio::test]
    async fn close_releases_waiters_empty_handed() {
        let serializer = RequestSerializer::new();
        let held = serializer.acquire().await.unwrap();

        let waiter = {
            let serializer = serializer.clone();
            tokio::spawn(async move { serializer.acquire().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        serializer.close();

        assert!(waiter.await.unwrap());
        assert!(serializer.is_closed());
        assert!(serializer.acquire().await.is_none());
        assert_eq!(serializer.queue_depth(), 0);
        drop(held);
    }
}
