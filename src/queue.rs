use crate::error::Error;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Bounded single-producer/single-consumer handoff between the receive
/// loop and the consumer. Enqueue blocks when full, dequeue blocks when
/// empty; completion carries the connection's terminal error. After
/// completion, dequeue drains remaining items and only then starts failing,
/// while enqueue fails immediately.
///
/// Both waits are cancel-safe: a caller dropped mid-wait neither consumes
/// an item nor loses one.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueState<T>>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    completed: Option<Arc<Error>>,
}

impl<T> BoundedQueue<T> {
    /// `capacity` must be at least 1; config validation enforces it before
    /// a queue is ever built.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                completed: None,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), Arc<Error>> {
        let mut item = Some(item);
        loop {
            {
                let mut state = self.inner.lock().unwrap();
                if let Some(err) = &state.completed {
                    return Err(err.clone());
                }
                if state.items.len() < self.capacity {
                    if let Some(value) = item.take() {
                        state.items.push_back(value);
                    }
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            self.not_full.notified().await;
        }
    }

    pub async fn dequeue(&self) -> Result<T, Arc<Error>> {
        loop {
            {
                let mut state = self.inner.lock().unwrap();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if let Some(err) = &state.completed {
                    return Err(err.clone());
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Completes the queue with a terminal error. Idempotent; the first
    /// error wins. Releases any blocked producer or consumer.
    pub fn complete(&self, err: Arc<Error>) {
        let mut state = self.inner.lock().unwrap();
        if state.completed.is_none() {
            state.completed = Some(err);
        }
        drop(state);
        self.not_full.notify_one();
        self.not_empty.notify_one();
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().unwrap().completed.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes `f` on every undelivered item under the gate, leaving the
    /// queue empty. Teardown uses this to release buffers the consumer will
    /// never see.
    pub fn drain(&self, mut f: impl FnMut(T)) {
        let drained: Vec<T> = {
            let mut state = self.inner.lock().unwrap();
            state.items.drain(..).collect()
        };
        for item in drained {
            f(item);
        }
        self.not_full.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn completed_err() -> Arc<Error> {
        Arc::new(Error::Aborted)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.enqueue(3).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_blocks_when_full() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.enqueue(1u32).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(2).await })
        };
        // The producer can't finish until a slot frees up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.dequeue().await.unwrap(), 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_item() {
        let queue = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue(7u32).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_completion_drains_then_fails() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(1u32).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.complete(completed_err());

        assert_eq!(queue.dequeue().await.unwrap(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        let err = queue.dequeue().await.unwrap_err();
        assert!(matches!(*err, Error::Aborted));
    }

    #[tokio::test]
    async fn test_completion_is_idempotent_first_error_wins() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        queue.complete(Arc::new(Error::PongTimeout));
        queue.complete(completed_err());
        let err = queue.dequeue().await.unwrap_err();
        assert!(matches!(*err, Error::PongTimeout));
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_completion() {
        let queue = BoundedQueue::new(1);
        queue.complete(completed_err());
        assert!(queue.enqueue(1u32).await.is_err());
    }

    #[tokio::test]
    async fn test_completion_releases_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete(completed_err());
        assert!(consumer.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_dequeue_consumes_nothing() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        // A dequeue that gets dropped mid-wait must not steal an item.
        let waited = timeout(Duration::from_millis(20), queue.dequeue()).await;
        assert!(waited.is_err());

        queue.enqueue(5).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_drain_visits_everything() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(1u32).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.complete(completed_err());

        let mut seen = Vec::new();
        queue.drain(|item| seen.push(item));
        assert_eq!(seen, vec![1, 2]);
        assert!(queue.is_empty());
    }
}
