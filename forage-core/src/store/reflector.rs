//! The loop that keeps a [`Store`] reflecting a [`Watcher`].
//!
//! List once, then consume the watch stream; on error, expiry, or stream
//! close, relist from scratch. The relist diff is what detects entities
//! that disappeared from the authoritative source.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{Keyed, Store};
use crate::watch::{ResourceToken, WatchEvent, Watcher, zero_token};

/// Policy for folding a newly observed entity onto the stored one, used
/// when a watch event must not discard locally enriched state (for bugs:
/// the fetched comment list).
pub type CarryFn<V> = Box<dyn Fn(&V, V) -> V + Send + Sync>;

/// What to do with a stored entity that the relist no longer reports.
#[derive(Debug)]
pub enum MissingAction<V> {
    /// Drop it from the store.
    Remove,
    /// Keep it untouched (it was already tombstoned).
    Keep,
    /// Swap in a tombstone record, exactly once.
    Replace(V),
}

/// Policy applied to entities that disappeared from the authoritative
/// listing. The default removes them; bugs instead get rewritten closed
/// once and then age out via TTL.
pub type TombstoneFn<V> = Box<dyn Fn(&V) -> MissingAction<V> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Re-emit update events for all entities this often; `None` disables.
    pub resync_interval: Option<Duration>,
    /// Delay before retrying after a failed relist.
    pub relist_backoff: Duration,
    pub page_size: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync_interval: Some(Duration::from_secs(15 * 60)),
            relist_backoff: Duration::from_secs(5),
            page_size: 500,
        }
    }
}

pub struct Reflector<V: Keyed, W> {
    watcher: Arc<W>,
    store: Arc<Store<V>>,
    config: ReflectorConfig,
    carry: Option<CarryFn<V>>,
    tombstone: Option<TombstoneFn<V>>,
}

impl<V: Keyed, W> std::fmt::Debug for Reflector<V, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reflector")
            .field("config", &self.config)
            .finish()
    }
}

impl<V, W> Reflector<V, W>
where
    V: Keyed + Clone,
    W: Watcher<V>,
{
    pub fn new(watcher: Arc<W>, store: Arc<Store<V>>, config: ReflectorConfig) -> Self {
        Self {
            watcher,
            store,
            config,
            carry: None,
            tombstone: None,
        }
    }

    /// Install a carry policy applied on every watch-event update.
    pub fn with_carry<F: Fn(&V, V) -> V + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.carry = Some(Box::new(f));
        self
    }

    /// Install a disappearance policy for relist diffs.
    pub fn with_tombstone<F: Fn(&V) -> MissingAction<V> + Send + Sync + 'static>(
        mut self,
        f: F,
    ) -> Self {
        self.tombstone = Some(Box::new(f));
        self
    }

    /// Run until cancelled. Alternates between full relists and watch
    /// stream consumption.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let token = match self.relist().await {
                Ok(token) => token,
                Err(err) => {
                    warn!("relist failed, backing off: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.relist_backoff) => continue,
                    }
                }
            };
            debug!("relist complete, watching from {token}");

            let mut stream = match self.watcher.watch(token, cancel.child_token()).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("watch failed to start: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.relist_backoff) => continue,
                    }
                }
            };

            let mut resync = self
                .config
                .resync_interval
                .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick(&mut resync) => {
                        debug!("resync: re-emitting {} entities", self.store.len());
                        self.store.resync();
                    }
                    event = stream.next() => match event {
                        None => {
                            info!("watch stream closed; relisting");
                            break;
                        }
                        Some(WatchEvent::Error(err)) => {
                            warn!("watch stream errored; relisting: {err}");
                            break;
                        }
                        Some(WatchEvent::Added(v)) | Some(WatchEvent::Modified(v)) => {
                            self.apply(&v);
                        }
                    }
                }
            }
        }
    }

    /// Full paginated listing applied to the store as a diff; returns the
    /// high watermark to resume watching from. Entities absent from the
    /// listing go through the tombstone policy.
    async fn relist(&self) -> Result<ResourceToken> {
        let mut items = Vec::new();
        let mut continue_token = None;
        let mut high_watermark = zero_token();
        loop {
            let page = self
                .watcher
                .list(continue_token, self.config.page_size)
                .await?;
            if page.high_watermark > high_watermark {
                high_watermark = page.high_watermark;
            }
            items.extend(page.items);
            match page.next_token {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        let mut seen = std::collections::HashSet::with_capacity(items.len());
        for item in items {
            seen.insert(item.key());
            self.apply(&Arc::new(item));
        }
        for key in self.store.keys() {
            if seen.contains(&key) {
                continue;
            }
            let Some(existing) = self.store.get(&key) else {
                continue;
            };
            match self.tombstone.as_ref().map(|f| f(&existing)) {
                None | Some(MissingAction::Remove) => {
                    self.store.remove(&key);
                }
                Some(MissingAction::Keep) => {}
                Some(MissingAction::Replace(tombstoned)) => {
                    self.store.insert(tombstoned);
                }
            }
        }
        self.store.mark_synced();
        Ok(high_watermark)
    }

    /// Apply one watch event. Stale or duplicate events (an entity we
    /// already hold at the same or newer change time) are dropped, which
    /// makes duplicated watchers idempotent.
    fn apply(&self, incoming: &Arc<V>) {
        let key = incoming.key();
        self.store.merge(&key, |current| match current {
            None => Some(incoming.as_ref().clone()),
            Some(existing) if existing.last_changed() >= incoming.last_changed() => None,
            Some(existing) => {
                let fresh = incoming.as_ref().clone();
                Some(match &self.carry {
                    Some(carry) => carry(existing, fresh),
                    None => fresh,
                })
            }
        });
    }
}

/// Await the next resync tick, or never when resync is disabled.
async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    use crate::error::SearchError;
    use crate::watch::{ListPage, WatchStream};

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        changed: DateTime<Utc>,
        payload: String,
    }

    impl Keyed for Item {
        type Key = String;

        fn key(&self) -> String {
            self.name.clone()
        }

        fn last_changed(&self) -> DateTime<Utc> {
            self.changed
        }
    }

    fn item(name: &str, changed: i64, payload: &str) -> Item {
        Item {
            name: name.to_string(),
            changed: Utc.timestamp_opt(changed, 0).unwrap(),
            payload: payload.to_string(),
        }
    }

    /// Watcher scripted from the test: a fixed listing plus an injectable
    /// event stream.
    struct ScriptedWatcher {
        listing: Mutex<Vec<Item>>,
        list_calls: AtomicUsize,
        events: Mutex<Option<mpsc::Receiver<WatchEvent<Item>>>>,
    }

    impl ScriptedWatcher {
        fn new(listing: Vec<Item>) -> (Arc<Self>, mpsc::Sender<WatchEvent<Item>>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    listing: Mutex::new(listing),
                    list_calls: AtomicUsize::new(0),
                    events: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl Watcher<Item> for ScriptedWatcher {
        async fn list(&self, _token: Option<String>, _limit: usize) -> Result<ListPage<Item>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let items = self.listing.lock().clone();
            let high_watermark = items
                .iter()
                .map(|i| i.changed)
                .max()
                .unwrap_or_else(zero_token);
            Ok(ListPage {
                items,
                next_token: None,
                high_watermark,
            })
        }

        async fn watch(
            &self,
            _since: ResourceToken,
            _cancel: CancellationToken,
        ) -> Result<WatchStream<Item>> {
            match self.events.lock().take() {
                Some(rx) => Ok(WatchStream::new(rx)),
                // Subsequent watches hang open with no events.
                None => {
                    let (_tx, rx) = mpsc::channel(1);
                    std::mem::forget(_tx);
                    Ok(WatchStream::new(rx))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_relist_then_events() {
        let (watcher, events) = ScriptedWatcher::new(vec![item("a", 10, "v1")]);
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            Arc::clone(&watcher),
            Arc::clone(&store),
            ReflectorConfig {
                resync_interval: None,
                ..ReflectorConfig::default()
            },
        );
        let task = tokio::spawn(reflector.run(cancel.clone()));

        events
            .send(WatchEvent::Added(Arc::new(item("b", 20, "v1"))))
            .await
            .unwrap();
        events
            .send(WatchEvent::Modified(Arc::new(item("a", 30, "v2"))))
            .await
            .unwrap();

        // Wait for the reflector to drain the channel.
        for _ in 0..100 {
            if store.get(&"a".to_string()).is_some_and(|v| v.payload == "v2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(store.has_synced());
        assert_eq!(store.get(&"a".to_string()).unwrap().payload, "v2");
        assert_eq!(store.get(&"b".to_string()).unwrap().payload, "v1");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_event_skipped() {
        let (watcher, events) = ScriptedWatcher::new(vec![item("a", 50, "fresh")]);
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            Arc::clone(&watcher),
            Arc::clone(&store),
            ReflectorConfig {
                resync_interval: None,
                ..ReflectorConfig::default()
            },
        );
        let task = tokio::spawn(reflector.run(cancel.clone()));

        // Older than what the relist installed: must not clobber.
        events
            .send(WatchEvent::Modified(Arc::new(item("a", 40, "stale"))))
            .await
            .unwrap();
        // A newer marker event we can wait on.
        events
            .send(WatchEvent::Added(Arc::new(item("z", 99, "marker"))))
            .await
            .unwrap();

        for _ in 0..100 {
            if store.get(&"z".to_string()).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.get(&"a".to_string()).unwrap().payload, "fresh");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_event_triggers_relist() {
        let (watcher, events) = ScriptedWatcher::new(vec![item("a", 10, "v1")]);
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            Arc::clone(&watcher),
            Arc::clone(&store),
            ReflectorConfig {
                resync_interval: None,
                relist_backoff: Duration::from_millis(1),
                ..ReflectorConfig::default()
            },
        );
        let task = tokio::spawn(reflector.run(cancel.clone()));

        // Entity disappears upstream, then the watch errors out.
        watcher.listing.lock().clear();
        events
            .send(WatchEvent::Error(SearchError::Remote("boom".to_string())))
            .await
            .unwrap();

        for _ in 0..100 {
            if watcher.list_calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The second relist observed the deletion.
        for _ in 0..100 {
            if store.get(&"a".to_string()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get(&"a".to_string()).is_none());
        assert!(watcher.list_calls.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tombstone_replaces_once() {
        let (watcher, events) = ScriptedWatcher::new(vec![item("a", 10, "live")]);
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            Arc::clone(&watcher),
            Arc::clone(&store),
            ReflectorConfig {
                resync_interval: None,
                relist_backoff: Duration::from_millis(1),
                ..ReflectorConfig::default()
            },
        )
        .with_tombstone(|existing: &Item| {
            if existing.payload == "closed" {
                MissingAction::Keep
            } else {
                let mut tombstone = existing.clone();
                tombstone.payload = "closed".to_string();
                MissingAction::Replace(tombstone)
            }
        });
        let task = tokio::spawn(reflector.run(cancel.clone()));

        // Disappears upstream; the error forces a relist.
        watcher.listing.lock().clear();
        events
            .send(WatchEvent::Error(SearchError::Remote("boom".to_string())))
            .await
            .unwrap();

        for _ in 0..100 {
            if store
                .get(&"a".to_string())
                .is_some_and(|v| v.payload == "closed")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let entry = store.get(&"a".to_string()).expect("kept as tombstone");
        assert_eq!(entry.payload, "closed");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_carry_preserves_enrichment() {
        let (watcher, events) = ScriptedWatcher::new(vec![item("a", 10, "enriched")]);
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let reflector = Reflector::new(
            Arc::clone(&watcher),
            Arc::clone(&store),
            ReflectorConfig {
                resync_interval: None,
                ..ReflectorConfig::default()
            },
        )
        .with_carry(|existing: &Item, mut fresh: Item| {
            fresh.payload = format!("{}+{}", existing.payload, fresh.payload);
            fresh
        });
        let task = tokio::spawn(reflector.run(cancel.clone()));

        events
            .send(WatchEvent::Modified(Arc::new(item("a", 20, "header"))))
            .await
            .unwrap();

        for _ in 0..100 {
            if store
                .get(&"a".to_string())
                .is_some_and(|v| v.payload.contains('+'))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.get(&"a".to_string()).unwrap().payload, "enriched+header");

        cancel.cancel();
        task.await.unwrap();
    }
}
