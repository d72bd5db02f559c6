//! Remote source clients: the bug tracker REST API, the object-storage
//! job index, and the live job-list endpoint.

pub mod deck;
pub mod jira;
pub mod objstore;
pub mod tracker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use forage_model::JobRun;
use rand::Rng;
use tracing::warn;

use crate::error::{Result, SearchError};
use crate::store::Store;

/// Retry an idempotent remote call with exponential backoff and jitter.
/// Only transient errors are retried; everything else surfaces at once.
pub async fn with_retries<T, F, Fut>(attempts: u32, base_delay: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                let pause = delay + Duration::from_millis(jitter);
                warn!("remote call failed (attempt {attempt}/{attempts}), retrying in {pause:?}: {err}");
                tokio::time::sleep(pause).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    Err(SearchError::Internal("retry loop exhausted".to_string()))
}

/// Fold a run reported by any source into the job store under the
/// conflict rule: for an already-known (`job_name`, `build_id`), the
/// record with the later `completion_time` wins. Returns whether the
/// store changed.
pub fn merge_job_run(store: &Arc<Store<JobRun>>, mut run: JobRun) -> bool {
    let key = run.key();
    store.merge(&key, move |current| match current {
        None => Some(run),
        Some(existing) => {
            // A source that cannot see artifacts (the live job list) must
            // not erase what the index already discovered.
            if run.artifact_prefix.is_empty() {
                run.artifact_prefix = existing.artifact_prefix.clone();
            }
            if run.status_url.is_empty() {
                run.status_url = existing.status_url.clone();
            }
            run.supersedes(existing).then_some(run)
        }
    })
}
