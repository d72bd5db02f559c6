//! TTL sweep over the corpus and the in-memory stores.
//!
//! Single-threaded, lock-free over the corpus: readers that see a file
//! vanish mid-parse get a NotFound and move on. Age decisions use mtime
//! exclusively, which the writer pinned to each entity's refresh time.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use forage_model::{Bug, JobRun};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::corpus::Corpus;
use crate::corpus::bugfile::{is_staging_name, parse_file_name};
use crate::error::Result;
use crate::store::{Keyed, Store};

/// Abandoned staging files die after this long.
const STAGING_MAX_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Files past the TTL window.
    pub expired: usize,
    /// Abandoned staging files.
    pub staging: usize,
    /// Valid names whose id the store no longer knows.
    pub unknown: usize,
    /// Names that are not corpus entities at all.
    pub foreign: usize,
    pub kept: usize,
}

impl SweepStats {
    pub fn removed(&self) -> usize {
        self.expired + self.staging + self.unknown + self.foreign
    }

    fn absorb(&mut self, other: SweepStats) {
        self.expired += other.expired;
        self.staging += other.staging;
        self.unknown += other.unknown;
        self.foreign += other.foreign;
        self.kept += other.kept;
    }
}

fn file_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    now.duration_since(modified).ok()
}

/// One pass over `bugs/`: expired, abandoned-staging, unknown-id, and
/// foreign files are unlinked. The known sets are the live store keys,
/// one per tracker dialect.
pub fn sweep_bugs(
    corpus: &Corpus,
    max_age: Duration,
    known_bugs: &HashSet<u32>,
    known_issues: &HashSet<u32>,
    now: SystemTime,
) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let dir = corpus.bugs_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if is_staging_name(name) {
            if file_age(&path, now).is_some_and(|age| age > STAGING_MAX_AGE) {
                debug!("removing abandoned staging file {name}");
                let _ = fs::remove_file(&path);
                stats.staging += 1;
            } else {
                stats.kept += 1;
            }
            continue;
        }
        let Some((dialect, id)) = parse_file_name(name) else {
            debug!("removing foreign file {name}");
            let _ = fs::remove_file(&path);
            stats.foreign += 1;
            continue;
        };
        if file_age(&path, now).is_some_and(|age| age > max_age) {
            debug!("removing expired bug file {name}");
            let _ = fs::remove_file(&path);
            stats.expired += 1;
            continue;
        }
        let known = match dialect {
            crate::corpus::Dialect::Bug => known_bugs,
            crate::corpus::Dialect::Issue => known_issues,
        };
        if !known.contains(&id) {
            debug!("removing bug file {name} for unknown id {id}");
            let _ = fs::remove_file(&path);
            stats.unknown += 1;
            continue;
        }
        stats.kept += 1;
    }
    Ok(stats)
}

/// One pass over `jobs/`: expired artifact files are unlinked and emptied
/// run directories removed. Marker dotfiles at the tree root survive.
pub fn sweep_jobs(corpus: &Corpus, max_age: Duration, now: SystemTime) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let root = corpus.jobs_dir();
    if root.exists() {
        sweep_jobs_dir(&root, &root, max_age, now, &mut stats)?;
    }
    Ok(stats)
}

fn sweep_jobs_dir(
    root: &Path,
    dir: &Path,
    max_age: Duration,
    now: SystemTime,
    stats: &mut SweepStats,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // The tree is unlocked; a run directory may vanish under us.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let is_marker = dir == root && name.to_str().is_some_and(|n| n.starts_with('.'));
        if path.is_dir() {
            sweep_jobs_dir(root, &path, max_age, now, stats)?;
            if fs::read_dir(&path)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
            {
                let _ = fs::remove_dir(&path);
            }
        } else if !is_marker && file_age(&path, now).is_some_and(|age| age > max_age) {
            let _ = fs::remove_file(&path);
            stats.expired += 1;
        } else {
            stats.kept += 1;
        }
    }
    Ok(())
}

/// Periodic sweeper task: prunes the stores by TTL, then reconciles the
/// disk trees against what survived.
pub struct Sweeper {
    corpus: Arc<Corpus>,
    bug_store: Option<Arc<Store<Bug>>>,
    issue_store: Option<Arc<Store<Bug>>>,
    job_store: Option<Arc<Store<JobRun>>>,
    config: SweeperConfig,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper").field("config", &self.config).finish()
    }
}

impl Sweeper {
    pub fn new(
        corpus: Arc<Corpus>,
        bug_store: Option<Arc<Store<Bug>>>,
        issue_store: Option<Arc<Store<Bug>>>,
        job_store: Option<Arc<Store<JobRun>>>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            corpus,
            bug_store,
            issue_store,
            job_store,
            config,
        }
    }

    /// One full pass; exposed for tests and for a final sweep at startup.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let now = SystemTime::now();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .unwrap_or_else(|_| chrono::Duration::days(14));

        // Entities outside the TTL window leave the stores first so the
        // file pass sees a consistent key set.
        let prune = |store: &Option<Arc<Store<Bug>>>| -> HashSet<u32> {
            match store {
                Some(store) => {
                    for stale in store.list(|bug| bug.refresh_time < cutoff) {
                        debug!("expiring bug {} from store", stale.id);
                        store.remove(&stale.id);
                    }
                    store.keys().into_iter().collect()
                }
                None => HashSet::new(),
            }
        };
        let known_bugs = prune(&self.bug_store);
        let known_issues = prune(&self.issue_store);
        if let Some(store) = &self.job_store {
            for stale in store.list(|run| run.last_changed() < cutoff) {
                store.remove(&Keyed::key(stale.as_ref()));
            }
        }

        let corpus = Arc::clone(&self.corpus);
        let max_age = self.config.max_age;
        let stats = tokio::task::spawn_blocking(move || -> Result<SweepStats> {
            let mut stats = sweep_bugs(&corpus, max_age, &known_bugs, &known_issues, now)?;
            stats.absorb(sweep_jobs(&corpus, max_age, now)?);
            Ok(stats)
        })
        .await
        .map_err(|err| crate::error::SearchError::Internal(format!("sweep task: {err}")))??;
        Ok(stats)
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            match self.sweep_once().await {
                Ok(stats) if stats.removed() > 0 => {
                    info!(
                        "sweep removed {} files ({} expired, {} staging, {} unknown, {} foreign)",
                        stats.removed(),
                        stats.expired,
                        stats.staging,
                        stats.unknown,
                        stats.foreign
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("sweep failed: {err}"),
            }
        }
    }
}
