//! Batched comment fetcher.
//!
//! Store event handlers enqueue bug ids; workers drain the queue in
//! batches, wait on the token bucket, issue one batched remote call, and
//! merge the comment lists back into the store. Merges are guarded by
//! `refresh_time` so an out-of-order fetch never clobbers newer state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use forage_model::{Bug, Comment};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::corpus::writer::PublishOp;
use crate::error::Result;
use crate::fetch::queue::WorkQueue;
use crate::fetch::ratelimit::TokenBucket;
use crate::sources::tracker::TrackerClient;
use crate::store::Store;

/// Remote capability the fetcher needs: one batched comment call.
#[async_trait]
pub trait CommentClient: Send + Sync {
    async fn comments_batch(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Comment>>>;
}

#[async_trait]
impl CommentClient for TrackerClient {
    async fn comments_batch(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Comment>>> {
        TrackerClient::comments_batch(self, ids).await
    }
}

#[derive(Debug, Clone)]
pub struct CommentFetcherConfig {
    /// Ids per batched remote call; bounded by the remote API.
    pub max_batch: usize,
    /// When set, private comments collapse to one redaction placeholder
    /// per issue; otherwise they are dropped entirely.
    pub redact_private: bool,
    /// Entities whose refresh_time is older than this get re-fetched.
    pub refresh_interval: Duration,
    pub workers: usize,
}

impl Default for CommentFetcherConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            redact_private: false,
            refresh_interval: Duration::from_secs(30 * 60),
            workers: 2,
        }
    }
}

pub struct CommentFetcher {
    store: Arc<Store<Bug>>,
    client: Arc<dyn CommentClient>,
    queue: Arc<WorkQueue<u32>>,
    bucket: TokenBucket,
    /// Publication requests for the corpus writer.
    publish_tx: mpsc::Sender<PublishOp>,
    config: CommentFetcherConfig,
}

impl std::fmt::Debug for CommentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentFetcher")
            .field("config", &self.config)
            .finish()
    }
}

impl CommentFetcher {
    pub fn new(
        store: Arc<Store<Bug>>,
        client: Arc<dyn CommentClient>,
        queue: Arc<WorkQueue<u32>>,
        bucket: TokenBucket,
        publish_tx: mpsc::Sender<PublishOp>,
        config: CommentFetcherConfig,
    ) -> Self {
        Self {
            store,
            client,
            queue,
            bucket,
            publish_tx,
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<u32>> {
        Arc::clone(&self.queue)
    }

    /// Drain batches until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers.max(1) {
            let fetcher = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                fetcher.worker(cancel).await;
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn worker(&self, cancel: CancellationToken) {
        loop {
            let Some(batch) = self.queue.take(self.config.max_batch, &cancel).await else {
                return;
            };
            if !self.bucket.acquire(&cancel).await {
                return;
            }
            self.process_batch(&batch).await;
        }
    }

    async fn process_batch(&self, batch: &[u32]) {
        let fetch_started = Utc::now();
        debug!("fetching comments for {} bugs", batch.len());
        let mut payload = match self.client.comments_batch(batch).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!("comment batch failed, requeueing {} ids: {err}", batch.len());
                for id in batch {
                    self.queue.retry(*id);
                }
                return;
            }
        };

        for id in batch {
            let Some(comments) = payload.remove(id) else {
                // The remote no longer knows this bug; the next relist
                // diff will delete it.
                debug!("bug {id} absent from comment response");
                self.queue.forget(id);
                continue;
            };
            let comments = apply_privacy_filter(comments, self.config.redact_private);

            let swapped = self.store.merge(id, |current| {
                let existing = current?;
                // Refuse out-of-order merges: something newer already
                // landed while this fetch was in flight.
                if existing.refresh_time > fetch_started {
                    return None;
                }
                let mut updated = existing.clone();
                updated.set_comments(comments);
                updated.refresh_time = Utc::now();
                Some(updated)
            });

            self.queue.forget(id);
            if swapped
                && self
                    .publish_tx
                    .send(PublishOp::Refresh(*id))
                    .await
                    .is_err()
            {
                return;
            }
        }
    }

    /// Re-enqueue anything not reconciled within the refresh interval.
    pub async fn run_refresh_sweeper(
        store: Arc<Store<Bug>>,
        queue: Arc<WorkQueue<u32>>,
        refresh_interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(refresh_interval / 2) => {}
            }
            let cutoff = Utc::now()
                - chrono::Duration::from_std(refresh_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1800));
            let stale = store.list(|bug| bug.refresh_time < cutoff);
            if !stale.is_empty() {
                info!("re-enqueueing {} stale bugs for refresh", stale.len());
            }
            for bug in stale {
                queue.add(bug.id);
            }
        }
    }
}

/// Apply the privacy policy. With redaction on, the first private comment
/// becomes a single placeholder with a sentinel author; with it off,
/// private comments vanish.
fn apply_privacy_filter(comments: Vec<Comment>, redact: bool) -> Vec<Comment> {
    let mut result = Vec::with_capacity(comments.len());
    let mut redacted = false;
    for comment in comments {
        if !comment.private {
            result.push(comment);
        } else if redact && !redacted {
            redacted = true;
            result.push(Comment::redacted(comment.id, comment.created_at));
        }
    }
    result
}
