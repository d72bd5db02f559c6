//! End-to-end bug pipeline: a fake tracker flows through the reflector,
//! the batched comment fetcher, and the atomic publisher into the corpus;
//! disappearance produces exactly one closed memorial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use forage_core::corpus::{BugPublisher, Corpus, Dialect, PublishOp};
use forage_core::error::Result;
use forage_core::fetch::comments::CommentClient;
use forage_core::fetch::{CommentFetcher, CommentFetcherConfig, TokenBucket, WorkQueue};
use forage_core::store::{MissingAction, Reflector, ReflectorConfig, Store, StoreEvent};
use forage_core::watch::ResourceToken;
use forage_core::watch::periodic::{ChangeLister, PeriodicWatcher, PeriodicWatcherConfig};
use forage_model::{Bug, Comment};

struct FakeTracker {
    bugs: Mutex<Vec<Bug>>,
    comments: Mutex<HashMap<u32, Vec<Comment>>>,
}

#[async_trait]
impl ChangeLister<Bug> for FakeTracker {
    async fn changed_since(
        &self,
        since: ResourceToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bug>> {
        Ok(self
            .bugs
            .lock()
            .iter()
            .filter(|bug| bug.last_changed_at > since)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommentClient for FakeTracker {
    async fn comments_batch(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Comment>>> {
        let comments = self.comments.lock();
        Ok(ids
            .iter()
            .filter_map(|id| comments.get(id).map(|c| (*id, c.clone())))
            .collect())
    }
}

fn sample_bug(id: u32) -> Bug {
    Bug {
        id,
        summary: format!("flaky test {id}"),
        status: "NEW".into(),
        resolution: String::new(),
        severity: "high".into(),
        priority: String::new(),
        creator: "reporter@example.com".into(),
        assignee: String::new(),
        keywords: vec![],
        whiteboard: String::new(),
        internal_whiteboard: String::new(),
        target_release: vec![],
        component: vec![],
        environment: String::new(),
        created_at: Utc::now() - chrono::Duration::hours(2),
        last_changed_at: Utc::now() - chrono::Duration::hours(1),
        comments: vec![],
        refresh_time: Utc::now() - chrono::Duration::hours(1),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bugs_flow_from_source_to_corpus_and_close() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus = Arc::new(Corpus::new(tmp.path()));
    corpus.ensure_layout().await.unwrap();

    let source = Arc::new(FakeTracker {
        bugs: Mutex::new(vec![sample_bug(181)]),
        comments: Mutex::new(HashMap::from([(
            181,
            vec![Comment {
                id: 1,
                author: "reporter@example.com".into(),
                created_at: Utc::now() - chrono::Duration::hours(2),
                body: "first seen on 4.19\n".into(),
                private: false,
            }],
        )])),
    });
    let store: Arc<Store<Bug>> = Arc::new(Store::new());
    let cancel = CancellationToken::new();

    // Publisher owns all writes under bugs/.
    let (publish_tx, publish_rx) = mpsc::channel(64);
    let publisher = BugPublisher::new(
        Arc::clone(&corpus),
        Arc::clone(&store),
        Dialect::Bug,
        publish_rx,
    );
    tokio::spawn(publisher.run(cancel.clone()));

    // Batched comment fetcher fed by store events.
    let queue = Arc::new(WorkQueue::default());
    let fetcher = Arc::new(CommentFetcher::new(
        Arc::clone(&store),
        Arc::clone(&source) as Arc<dyn CommentClient>,
        Arc::clone(&queue),
        TokenBucket::new(100, Duration::from_secs(1)),
        publish_tx.clone(),
        CommentFetcherConfig::default(),
    ));
    tokio::spawn(fetcher.run(cancel.clone()));
    {
        let queue = Arc::clone(&queue);
        store.add_handler(move |event| match event {
            StoreEvent::Added(bug) => queue.add(bug.id),
            StoreEvent::Updated { old, new } => {
                if new.is_closed() && !old.is_closed() {
                    let _ = publish_tx.try_send(PublishOp::Closed(Arc::clone(new)));
                } else if !new.is_closed() {
                    queue.add(new.id);
                }
            }
            StoreEvent::Deleted(_) => {}
        });
    }

    // Fast reflector: short polls, short watch lifetime so relists (and
    // with them disappearance detection) happen quickly.
    let watcher = Arc::new(PeriodicWatcher::new(
        Arc::clone(&source),
        PeriodicWatcherConfig {
            poll_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            page_size: 50,
        },
    ));
    let reflector = Reflector::new(
        watcher,
        Arc::clone(&store),
        ReflectorConfig {
            resync_interval: None,
            relist_backoff: Duration::from_millis(10),
            page_size: 50,
        },
    )
    .with_carry(|existing: &Bug, mut fresh: Bug| {
        fresh.comments = existing.comments.clone();
        fresh.refresh_time = existing.refresh_time;
        fresh
    })
    .with_tombstone(|bug: &Bug| {
        if bug.is_closed() {
            MissingAction::Keep
        } else {
            let mut memorial = bug.clone();
            memorial.status = "CLOSED".to_string();
            MissingAction::Replace(memorial)
        }
    });
    tokio::spawn(reflector.run(cancel.clone()));

    // The record reaches disk complete with its fetched comment.
    let bug_path = corpus.bug_path(181, Dialect::Bug);
    wait_for("bug file with comment", || {
        std::fs::read_to_string(&bug_path)
            .map(|text| text.contains("first seen on 4.19"))
            .unwrap_or(false)
    })
    .await;
    let text = std::fs::read_to_string(&bug_path).unwrap();
    assert!(text.starts_with("Bug 181: flaky test 181\n"));
    assert!(text.contains("Status: NEW\n"));
    assert!(store.has_synced());

    // The bug disappears from the authoritative listing: the next relist
    // rewrites it closed, once, and keeps it in the store for TTL.
    source.bugs.lock().clear();
    wait_for("closed memorial", || {
        std::fs::read_to_string(&bug_path)
            .map(|text| text.contains("Status: CLOSED"))
            .unwrap_or(false)
    })
    .await;
    assert!(store.get(&181).is_some_and(|bug| bug.is_closed()));
    // The comment body survived the closing rewrite.
    let text = std::fs::read_to_string(&bug_path).unwrap();
    assert!(text.contains("first seen on 4.19"));

    cancel.cancel();
}
