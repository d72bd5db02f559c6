//! Live job-list endpoint poller.
//!
//! The CI frontend exposes the currently-known job runs as one JSON
//! document. The poller merges those runs into the job store (the index
//! scanner usually saw them first) and keeps the raw payload around for
//! the `/jobs` passthrough endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forage_model::{JobRun, JobState, Trigger};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SearchError};
use crate::sources::merge_job_run;
use crate::store::Store;

/// Shared cache of the most recent raw job-list payload; `None` until the
/// first successful fetch.
#[derive(Debug, Clone, Default)]
pub struct JobsSnapshot {
    raw: Arc<RwLock<Option<Arc<Vec<u8>>>>>,
}

impl JobsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.raw.read().clone()
    }

    fn set(&self, payload: Vec<u8>) {
        *self.raw.write() = Some(Arc::new(payload));
    }
}

#[derive(Debug, Clone)]
pub struct DeckConfig {
    /// Frontend base URL; the job list lives at `prowjobs.js`.
    pub base_url: Url,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct DeckPoller {
    config: DeckConfig,
    http: reqwest::Client,
    store: Arc<Store<JobRun>>,
    snapshot: JobsSnapshot,
}

impl DeckPoller {
    pub fn new(
        config: DeckConfig,
        store: Arc<Store<JobRun>>,
        snapshot: JobsSnapshot,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SearchError::Internal(format!("building deck client: {err}")))?;
        Ok(Self {
            config,
            http,
            store,
            snapshot,
        })
    }

    async fn fetch(&self) -> Result<(Vec<JobRun>, Vec<u8>)> {
        let url = self
            .config
            .base_url
            .join("prowjobs.js")
            .map_err(|err| SearchError::Internal(format!("deck url: {err}")))?;
        let response = self.http.get(url).send().await?.error_for_status()?;
        let raw = response.bytes().await?.to_vec();
        let listing: JobListResponse = serde_json::from_slice(&raw)?;

        let mut runs = Vec::with_capacity(listing.items.len());
        for item in listing.items {
            match item.into_run() {
                Ok(run) => runs.push(run),
                Err(err) => warn!("dropping malformed job entry: {err}"),
            }
        }
        Ok((runs, raw))
    }

    /// Poll until cancelled. Failures keep the previous snapshot.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            match self.fetch().await {
                Ok((runs, raw)) => {
                    let mut merged = 0;
                    for run in runs {
                        if merge_job_run(&self.store, run) {
                            merged += 1;
                        }
                    }
                    debug!("job list fetched, {merged} runs merged");
                    self.snapshot.set(raw);
                }
                Err(err) => warn!("job list fetch failed: {err}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobListResponse {
    #[serde(default)]
    items: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    spec: RawJobSpec,
    #[serde(default)]
    status: RawJobStatus,
}

#[derive(Debug, Default, Deserialize)]
struct RawJobSpec {
    #[serde(default)]
    job: String,
    #[serde(default, rename = "type")]
    job_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawJobStatus {
    #[serde(default)]
    state: String,
    #[serde(default, rename = "startTime")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "completionTime")]
    completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    build_id: String,
}

impl RawJob {
    fn into_run(self) -> Result<JobRun> {
        if self.spec.job.is_empty() {
            return Err(SearchError::Malformed("job entry missing name".to_string()));
        }
        if self.status.build_id.is_empty() {
            return Err(SearchError::Malformed(format!(
                "job {} missing build id",
                self.spec.job
            )));
        }
        let state = self
            .status
            .state
            .parse::<JobState>()
            .map_err(|err| SearchError::Malformed(err.to_string()))?;
        Ok(JobRun {
            job_name: self.spec.job,
            build_id: self.status.build_id,
            state,
            start_time: self.status.start_time,
            completion_time: self.status.completion_time,
            status_url: self.status.url,
            trigger: Trigger::from_job_type(&self.spec.job_type),
            artifact_prefix: String::new(),
        })
    }
}
