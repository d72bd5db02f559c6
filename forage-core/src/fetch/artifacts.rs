//! Build-log and JUnit artifact pipeline.
//!
//! Terminal job runs inside the TTL window get their artifacts
//! materialized under the jobs tree: `junit.failures` concatenates the
//! failing testcase bodies from every junit report, `build-log.txt` holds
//! the tail of the log and is only fetched for failed runs. The run
//! directory's mtime records the completion time that was processed, so
//! re-deliveries of the same run are skipped.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forage_model::{JobKey, JobRun};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::corpus::Corpus;
use crate::corpus::writer::write_file_atomic;
use crate::error::{Result, SearchError};
use crate::fetch::junit::{extract_failures, is_junit_artifact};
use crate::fetch::queue::WorkQueue;
use crate::sources::objstore::ObjStoreClient;
use crate::store::Store;

pub const BUILD_LOG: &str = "build-log.txt";
pub const JUNIT_FAILURES: &str = "junit.failures";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// Full bucket-relative object name.
    pub name: String,
    pub size: u64,
}

/// Remote capability the pipeline needs: enumerate a run's artifacts and
/// read object tails.
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    async fn list_artifacts(&self, prefix: &str) -> Result<Vec<ArtifactEntry>>;
    async fn download_tail(&self, name: &str, max_bytes: u64) -> Result<Vec<u8>>;
}

#[async_trait]
impl ArtifactClient for ObjStoreClient {
    async fn list_artifacts(&self, prefix: &str) -> Result<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_objects(prefix, None, page_token.as_deref())
                .await?;
            for object in page.items {
                let size = object
                    .size
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                entries.push(ArtifactEntry {
                    name: object.name,
                    size,
                });
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn download_tail(&self, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
        ObjStoreClient::download_tail(self, name, max_bytes).await
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactFetcherConfig {
    /// Bucket segment under the jobs tree the artifacts land in.
    pub bucket: String,
    /// Runs completed longer ago than this are not materialized.
    pub max_age: Duration,
    /// Only the last portion of a build log is worth indexing.
    pub log_tail_bytes: u64,
    /// Ceiling on a single junit report download.
    pub junit_max_bytes: u64,
    pub workers: usize,
}

impl Default for ArtifactFetcherConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            max_age: Duration::from_secs(14 * 24 * 3600),
            log_tail_bytes: 20 * 1024 * 1024,
            junit_max_bytes: 50 * 1024 * 1024,
            workers: 4,
        }
    }
}

pub struct ArtifactFetcher {
    corpus: Arc<Corpus>,
    client: Arc<dyn ArtifactClient>,
    store: Arc<Store<JobRun>>,
    queue: Arc<WorkQueue<JobKey>>,
    config: ArtifactFetcherConfig,
}

impl std::fmt::Debug for ArtifactFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactFetcher")
            .field("config", &self.config)
            .finish()
    }
}

impl ArtifactFetcher {
    pub fn new(
        corpus: Arc<Corpus>,
        client: Arc<dyn ArtifactClient>,
        store: Arc<Store<JobRun>>,
        queue: Arc<WorkQueue<JobKey>>,
        config: ArtifactFetcherConfig,
    ) -> Self {
        Self {
            corpus,
            client,
            store,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<JobKey>> {
        Arc::clone(&self.queue)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers.max(1) {
            let fetcher = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                while let Some(batch) = fetcher.queue.take(1, &cancel).await {
                    for key in batch {
                        fetcher.process(key).await;
                    }
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn process(&self, key: JobKey) {
        let Some(run) = self.store.get(&key) else {
            self.queue.forget(&key);
            return;
        };
        match self.materialize(&run).await {
            Ok(true) => {
                debug!("materialized artifacts for {}/{}", run.job_name, run.build_id);
                self.queue.forget(&key);
            }
            Ok(false) => self.queue.forget(&key),
            Err(err) if err.is_transient() => {
                warn!(
                    "artifact fetch for {}/{} failed, will retry: {err}",
                    run.job_name, run.build_id
                );
                self.queue.retry(key);
            }
            Err(err) => {
                warn!(
                    "artifact fetch for {}/{} failed permanently: {err}",
                    run.job_name, run.build_id
                );
                self.queue.forget(&key);
            }
        }
    }

    /// Returns whether anything was fetched; `Ok(false)` means the run was
    /// skipped (not terminal, out of window, or already materialized).
    pub async fn materialize(&self, run: &JobRun) -> Result<bool> {
        if !run.state.is_terminal() || run.artifact_prefix.is_empty() {
            return Ok(false);
        }
        let Some(completion) = run.completion_time else {
            return Ok(false);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .unwrap_or_else(|_| chrono::Duration::days(14));
        if completion < cutoff {
            return Ok(false);
        }

        let dir = self
            .corpus
            .job_run_dir(&self.config.bucket, &run.artifact_prefix)?;
        if already_materialized(&dir, completion).await {
            return Ok(false);
        }

        // All remote I/O happens before the first local write, so a
        // transient failure leaves the directory untouched and retryable.
        let prefix = format!("{}/", run.artifact_prefix.trim_end_matches('/'));
        let artifacts = self.client.list_artifacts(&prefix).await?;

        let mut failures = String::new();
        for artifact in artifacts.iter().filter(|a| is_junit_artifact(&a.name)) {
            let data = self
                .client
                .download_tail(&artifact.name, self.config.junit_max_bytes)
                .await?;
            match extract_failures(&data) {
                Ok(extracted) => failures.push_str(&extracted),
                Err(err) => warn!("unparseable junit report {}: {err}", artifact.name),
            }
        }
        let log_tail = if run.state.is_failed() {
            let log_name = format!("{prefix}{BUILD_LOG}");
            if artifacts.iter().any(|a| a.name == log_name) {
                Some(
                    self.client
                        .download_tail(&log_name, self.config.log_tail_bytes)
                        .await?,
                )
            } else {
                None
            }
        } else {
            None
        };

        tokio::fs::create_dir_all(&dir).await?;
        if !failures.is_empty() {
            write_artifact(&dir, JUNIT_FAILURES, failures.into_bytes(), completion).await?;
        }
        if let Some(tail) = log_tail {
            write_artifact(&dir, BUILD_LOG, tail, completion).await?;
        }
        set_mtime(&dir, completion).await;
        Ok(true)
    }
}

/// The run directory's mtime is the completion time last processed.
async fn already_materialized(dir: &Path, completion: DateTime<Utc>) -> bool {
    match tokio::fs::metadata(dir).await {
        Ok(meta) => meta
            .modified()
            .map(|mtime| mtime >= SystemTime::from(completion))
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn write_artifact(
    dir: &Path,
    name: &str,
    data: Vec<u8>,
    mtime: DateTime<Utc>,
) -> Result<()> {
    let staging = dir.join(format!("z-{name}"));
    let target = dir.join(name);
    let mtime = SystemTime::from(mtime);
    tokio::task::spawn_blocking(move || write_file_atomic(&staging, &target, &data, mtime))
        .await
        .map_err(|err| SearchError::Internal(format!("artifact write task: {err}")))??;
    Ok(())
}

async fn set_mtime(path: &Path, at: DateTime<Utc>) {
    let path = path.to_path_buf();
    let at = SystemTime::from(at);
    let _ = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&path)
            .and_then(|file| file.set_times(std::fs::FileTimes::new().set_modified(at)))
    })
    .await;
}
