//! Deduplicating FIFO work queue with rate-limited retries.
//!
//! Keys enqueue at most once until taken; failed keys re-enter after an
//! exponential backoff with jitter, and a key that exhausts its retry
//! budget is dropped — the next store resync rediscovers it.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(10 * 60),
        }
    }
}

struct Delayed<K> {
    at: Instant,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    // Reversed: the binary heap is a max-heap, we want the earliest due.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at)
    }
}

struct Inner<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    retries: HashMap<K, u32>,
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    config: WorkQueueConfig,
}

impl<K> Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkQueue")
            .field("ready", &inner.ready.len())
            .field("delayed", &inner.delayed.len())
            .finish()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new(WorkQueueConfig::default())
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new(config: WorkQueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                delayed: BinaryHeap::new(),
                retries: HashMap::new(),
            }),
            notify: Notify::new(),
            config,
        }
    }

    /// Enqueue a key unless it is already waiting.
    pub fn add(&self, key: K) {
        {
            let mut inner = self.inner.lock();
            if !inner.queued.insert(key.clone()) {
                return;
            }
            inner.ready.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Clear the retry count after successful processing.
    pub fn forget(&self, key: &K) {
        self.inner.lock().retries.remove(key);
    }

    /// Re-enqueue a failed key after backoff. Returns `false` (and drops
    /// the key) once the retry budget is exhausted.
    pub fn retry(&self, key: K) -> bool {
        let mut inner = self.inner.lock();
        let attempts = inner.retries.get(&key).copied().unwrap_or(0) + 1;
        if attempts > self.config.max_retries {
            inner.retries.remove(&key);
            inner.queued.remove(&key);
            warn!("dropping {key:?} after {} failed attempts", attempts - 1);
            return false;
        }
        inner.retries.insert(key.clone(), attempts);
        if inner.queued.insert(key.clone()) {
            let backoff = self
                .config
                .retry_base
                .saturating_mul(2u32.saturating_pow(attempts - 1))
                .min(self.config.retry_max);
            let jitter =
                Duration::from_millis(rand::rng().random_range(0..=backoff.as_millis() as u64 / 4));
            inner.delayed.push(Delayed {
                at: Instant::now() + backoff + jitter,
                key,
            });
            drop(inner);
            // A waiter parked before this entry existed must recompute
            // its deadline.
            self.notify.notify_one();
        }
        true
    }

    /// Number of keys currently waiting (ready or delayed).
    pub fn len(&self) -> usize {
        self.inner.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take up to `max` ready keys, waiting if none are due yet. Returns
    /// `None` on cancellation.
    pub async fn take(&self, max: usize, cancel: &CancellationToken) -> Option<Vec<K>> {
        loop {
            let next_deadline = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                while inner
                    .delayed
                    .peek()
                    .is_some_and(|delayed| delayed.at <= now)
                {
                    let delayed = inner.delayed.pop().expect("peeked entry");
                    inner.ready.push_back(delayed.key);
                }
                if !inner.ready.is_empty() {
                    let count = inner.ready.len().min(max);
                    let batch: Vec<K> = inner.ready.drain(..count).collect();
                    for key in &batch {
                        inner.queued.remove(key);
                    }
                    return Some(batch);
                }
                inner.delayed.peek().map(|delayed| delayed.at)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<u32> {
        WorkQueue::new(WorkQueueConfig {
            max_retries: 2,
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(1),
        })
    }

    #[tokio::test]
    async fn test_fifo_and_dedup() {
        let q = queue();
        q.add(1);
        q.add(2);
        q.add(1); // duplicate, ignored
        q.add(3);

        let cancel = CancellationToken::new();
        let batch = q.take(10, &cancel).await.unwrap();
        assert_eq!(batch, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_take_respects_max() {
        let q = queue();
        for key in 0..5 {
            q.add(key);
        }
        let cancel = CancellationToken::new();
        assert_eq!(q.take(2, &cancel).await.unwrap(), vec![0, 1]);
        assert_eq!(q.take(2, &cancel).await.unwrap(), vec![2, 3]);
        assert_eq!(q.take(2, &cancel).await.unwrap(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_drop() {
        let q = queue();
        let cancel = CancellationToken::new();

        q.add(7);
        assert_eq!(q.take(1, &cancel).await.unwrap(), vec![7]);

        assert!(q.retry(7));
        // Becomes ready again after the backoff elapses (paused clock
        // advances automatically).
        assert_eq!(q.take(1, &cancel).await.unwrap(), vec![7]);

        assert!(q.retry(7));
        assert_eq!(q.take(1, &cancel).await.unwrap(), vec![7]);

        // Third failure exceeds max_retries=2: dropped.
        assert!(!q.retry(7));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_forget_resets_budget() {
        let q = queue();
        let cancel = CancellationToken::new();

        q.add(9);
        q.take(1, &cancel).await.unwrap();
        assert!(q.retry(9));
        q.take(1, &cancel).await.unwrap();
        q.forget(&9);

        // Budget starts over after a success.
        q.add(9);
        q.take(1, &cancel).await.unwrap();
        assert!(q.retry(9));
        assert!(q.retry(9));
        assert!(!q.retry(9));
    }

    #[tokio::test]
    async fn test_take_cancelled() {
        let q = queue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.take(1, &cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_waiter_wakes_on_retry() {
        let q = std::sync::Arc::new(queue());
        let cancel = CancellationToken::new();

        q.add(5);
        assert_eq!(q.take(1, &cancel).await.unwrap(), vec![5]);

        // Park a waiter with nothing pending, then schedule the retry.
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q2.take(1, &cancel).await
        });
        tokio::task::yield_now().await;
        assert!(q.retry(5));
        assert_eq!(waiter.await.unwrap().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_take_wakes_on_add() {
        let q = std::sync::Arc::new(queue());
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q2.take(1, &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.add(42);
        assert_eq!(waiter.await.unwrap().unwrap(), vec![42]);
    }
}
