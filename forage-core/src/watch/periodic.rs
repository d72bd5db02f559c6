//! Poll-based watcher implementation.
//!
//! Ticks on a configured interval, lists entities changed since the
//! current token, and emits one event per changed entity in
//! `last_changed_at` order. A `max_interval` bound forces the stream to
//! terminate with an explicit expiry error so long-lived consumers relist
//! instead of trusting an ever-older token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SearchError};
use crate::store::Keyed;
use crate::watch::{ListPage, ResourceToken, WatchEvent, WatchStream, Watcher, zero_token};

/// A source that can enumerate entities changed after a point in time.
#[async_trait]
pub trait ChangeLister<V>: Send + Sync {
    /// Entities with `last_changed_at > since`, starting at `offset`,
    /// returning at most `limit`. Order is unspecified; the watcher sorts.
    async fn changed_since(
        &self,
        since: ResourceToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<V>>;
}

/// Upper bound on pages gathered in one tick; a source reporting more
/// than this many changed entities in one interval is relisted instead.
const MAX_PAGES_PER_TICK: usize = 100;

#[derive(Debug, Clone)]
pub struct PeriodicWatcherConfig {
    pub poll_interval: Duration,
    /// Watch streams older than this end with an expiry error.
    pub max_interval: Duration,
    pub page_size: usize,
}

impl Default for PeriodicWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(30 * 60),
            page_size: 250,
        }
    }
}

pub struct PeriodicWatcher<L> {
    lister: Arc<L>,
    config: PeriodicWatcherConfig,
}

impl<L> std::fmt::Debug for PeriodicWatcher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicWatcher")
            .field("config", &self.config)
            .finish()
    }
}

impl<L> PeriodicWatcher<L> {
    pub fn new(lister: Arc<L>, config: PeriodicWatcherConfig) -> Self {
        Self { lister, config }
    }
}

/// Gather every entity changed after `since`, across pages.
async fn collect_changed<V, L>(
    lister: &L,
    config: &PeriodicWatcherConfig,
    since: ResourceToken,
) -> Result<Vec<V>>
where
    V: Keyed + Clone,
    L: ChangeLister<V>,
{
    let mut items = Vec::new();
    let mut offset = 0;
    for _ in 0..MAX_PAGES_PER_TICK {
        let page = lister.changed_since(since, offset, config.page_size).await?;
        let len = page.len();
        items.extend(page);
        if len < config.page_size {
            return Ok(items);
        }
        offset += len;
    }
    Err(SearchError::Expired(format!(
        "more than {MAX_PAGES_PER_TICK} pages changed since {since}; relist required"
    )))
}

#[async_trait]
impl<V, L> Watcher<V> for PeriodicWatcher<L>
where
    V: Keyed + Clone,
    L: ChangeLister<V> + 'static,
{
    async fn list(&self, continue_token: Option<String>, limit: usize) -> Result<ListPage<V>> {
        let offset = match continue_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SearchError::Malformed(format!("bad continue token {token:?}")))?,
            None => 0,
        };
        let items = self
            .lister
            .changed_since(zero_token(), offset, limit)
            .await?;
        let high_watermark = items
            .iter()
            .map(|v| v.last_changed())
            .max()
            .unwrap_or_else(zero_token);
        let next_token = (items.len() == limit).then(|| (offset + items.len()).to_string());
        Ok(ListPage {
            items,
            next_token,
            high_watermark,
        })
    }

    async fn watch(
        &self,
        since: ResourceToken,
        cancel: CancellationToken,
    ) -> Result<WatchStream<V>> {
        let (tx, rx) = mpsc::channel(256);
        let lister = Arc::clone(&self.lister);
        let config = self.config.clone();

        tokio::spawn(async move {
            run_watch(lister, config, since, tx, cancel).await;
        });

        Ok(WatchStream::new(rx))
    }
}

async fn run_watch<V, L>(
    lister: Arc<L>,
    config: PeriodicWatcherConfig,
    since: ResourceToken,
    tx: mpsc::Sender<WatchEvent<V>>,
    cancel: CancellationToken,
) where
    V: Keyed + Clone,
    L: ChangeLister<V>,
{
    let started = Instant::now();
    let mut token = since;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("watch cancelled at token {token}");
                return;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        if started.elapsed() >= config.max_interval {
            let _ = tx
                .send(WatchEvent::Error(SearchError::Expired(format!(
                    "watch exceeded {:?}",
                    config.max_interval
                ))))
                .await;
            return;
        }

        let mut items = match collect_changed(lister.as_ref(), &config, token).await {
            Ok(items) => items,
            Err(err) => {
                warn!("watch listing failed: {err}");
                let _ = tx.send(WatchEvent::Error(err)).await;
                return;
            }
        };

        // Oldest change first within the tick; the token only ever
        // advances.
        items.sort_by_key(|v| v.last_changed());
        let tick_token = token;
        for item in items {
            let changed = item.last_changed();
            let event = if item.created().is_some_and(|c| c > tick_token) {
                WatchEvent::Added(Arc::new(item))
            } else {
                WatchEvent::Modified(Arc::new(item))
            };
            if tx.send(event).await.is_err() {
                return;
            }
            if changed > token {
                token = changed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        changed: DateTime<Utc>,
        created: DateTime<Utc>,
    }

    impl Keyed for Item {
        type Key = String;

        fn key(&self) -> String {
            self.name.clone()
        }

        fn last_changed(&self) -> DateTime<Utc> {
            self.changed
        }

        fn created(&self) -> Option<DateTime<Utc>> {
            Some(self.created)
        }
    }

    struct FakeLister {
        items: Mutex<Vec<Item>>,
        fail: Mutex<bool>,
    }

    impl FakeLister {
        fn new(items: Vec<Item>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items),
                fail: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl ChangeLister<Item> for FakeLister {
        async fn changed_since(
            &self,
            since: ResourceToken,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Item>> {
            if *self.fail.lock() {
                return Err(SearchError::Remote("listing failed".to_string()));
            }
            let changed: Vec<Item> = self
                .items
                .lock()
                .iter()
                .filter(|i| i.changed > since)
                .cloned()
                .collect();
            Ok(changed.into_iter().skip(offset).take(limit).collect())
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(name: &str, changed: i64, created: i64) -> Item {
        Item {
            name: name.to_string(),
            changed: ts(changed),
            created: ts(created),
        }
    }

    fn watcher(
        lister: Arc<FakeLister>,
        poll: Duration,
        max: Duration,
    ) -> PeriodicWatcher<FakeLister> {
        PeriodicWatcher::new(
            lister,
            PeriodicWatcherConfig {
                poll_interval: poll,
                max_interval: max,
                page_size: 10,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_sorted_and_token_advances() {
        let lister = FakeLister::new(vec![
            item("b", 300, 10),
            item("a", 100, 10),
            item("c", 200, 150),
        ]);
        let w = watcher(Arc::clone(&lister), Duration::from_secs(30), Duration::from_secs(3600));
        let mut stream = w
            .watch(ts(50), CancellationToken::new())
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            match stream.next().await.unwrap() {
                WatchEvent::Added(v) => order.push((v.name.clone(), true)),
                WatchEvent::Modified(v) => order.push((v.name.clone(), false)),
                WatchEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        // Oldest change first; only `c` was created after the token.
        assert_eq!(
            order,
            vec![
                ("a".to_string(), false),
                ("c".to_string(), true),
                ("b".to_string(), false),
            ]
        );

        // Next tick sees nothing new: the token advanced past all items.
        lister.items.lock().push(item("d", 400, 400));
        match stream.next().await.unwrap() {
            WatchEvent::Added(v) => assert_eq!(v.name, "d"),
            other => panic!("expected added event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_emits_error_and_closes() {
        let lister = FakeLister::new(vec![]);
        let w = watcher(lister, Duration::from_secs(30), Duration::from_secs(60));
        let mut stream = w.watch(ts(0), CancellationToken::new()).await.unwrap();

        match stream.next().await.unwrap() {
            WatchEvent::Error(SearchError::Expired(_)) => {}
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_closes_stream() {
        let lister = FakeLister::new(vec![]);
        *lister.fail.lock() = true;
        let w = watcher(lister, Duration::from_secs(30), Duration::from_secs(3600));
        let mut stream = w.watch(ts(0), CancellationToken::new()).await.unwrap();

        match stream.next().await.unwrap() {
            WatchEvent::Error(SearchError::Remote(_)) => {}
            other => panic!("expected remote error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_promptly() {
        let lister = FakeLister::new(vec![item("a", 100, 10)]);
        let cancel = CancellationToken::new();
        let w = watcher(lister, Duration::from_secs(30), Duration::from_secs(3600));
        let mut stream = w.watch(ts(0), cancel.clone()).await.unwrap();
        cancel.cancel();
        // The producer may have emitted at most one tick before observing
        // cancellation; the stream must close either way.
        while let Some(event) = stream.next().await {
            if let WatchEvent::Error(e) = event {
                panic!("unexpected error: {e}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_pagination() {
        let items: Vec<Item> = (0..25).map(|i| item(&format!("i{i}"), 100 + i, 1)).collect();
        let lister = FakeLister::new(items);
        let w = watcher(lister, Duration::from_secs(30), Duration::from_secs(3600));

        let first = w.list(None, 10).await.unwrap();
        assert_eq!(first.items.len(), 10);
        let token = first.next_token.expect("more pages");

        let second = w.list(Some(token), 10).await.unwrap();
        assert_eq!(second.items.len(), 10);
        let token = second.next_token.expect("more pages");

        let last = w.list(Some(token), 10).await.unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(last.next_token.is_none());
        assert_eq!(last.high_watermark, ts(124));
    }
}
