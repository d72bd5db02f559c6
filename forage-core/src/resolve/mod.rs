//! Corpus path resolution.
//!
//! The search engine only knows file paths; the renderer needs entity
//! kind, display name, URL, and freshness. The resolver answers both
//! directions: `metadata` enriches one corpus-relative path, `restrict`
//! narrows a query to the explicit path arguments handed to the engine,
//! ordered newest-first so byte budgets favor recent results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forage_model::{Bug, IndexKind, PathKind, PathMetadata, Trigger};
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::corpus::Corpus;
use crate::corpus::bugfile::{is_staging_name, parse_file_name};
use crate::error::{Result, SearchError};
use crate::fetch::artifacts::{BUILD_LOG, JUNIT_FAILURES};
use crate::store::Store;

/// One indexed corpus file, as of the last walk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskEntry {
    /// Corpus-relative path using `/` separators.
    pub rel_path: String,
    pub kind: PathKind,
    pub modified: DateTime<Utc>,
    /// Job name for artifact files; `None` for bugs.
    pub job_name: Option<String>,
    pub trigger: Option<Trigger>,
    pub bug_id: Option<u32>,
}

/// Immutable snapshot of the corpus tree built by one walk.
#[derive(Debug, Default)]
pub struct DiskIndex {
    by_path: HashMap<String, DiskEntry>,
}

impl DiskIndex {
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn get(&self, rel_path: &str) -> Option<&DiskEntry> {
        self.by_path.get(rel_path)
    }

    /// Walk the corpus and index every live entity file.
    pub fn build(corpus: &Corpus) -> Result<DiskIndex> {
        let mut by_path = HashMap::new();

        let bugs_dir = corpus.bugs_dir();
        if let Ok(entries) = std::fs::read_dir(&bugs_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if is_staging_name(name) {
                    continue;
                }
                let Some((_, id)) = parse_file_name(name) else {
                    continue;
                };
                let Ok(meta) = entry.metadata() else { continue };
                let Ok(modified) = meta.modified() else { continue };
                let rel_path = format!("bugs/{name}");
                by_path.insert(
                    rel_path.clone(),
                    DiskEntry {
                        rel_path,
                        kind: PathKind::Bug,
                        modified: modified.into(),
                        job_name: None,
                        trigger: None,
                        bug_id: Some(id),
                    },
                );
            }
        }

        let jobs_dir = corpus.jobs_dir();
        if jobs_dir.exists() {
            walk_jobs(&jobs_dir, &jobs_dir, &mut by_path)?;
        }
        Ok(DiskIndex { by_path })
    }
}

fn walk_jobs(
    root: &Path,
    dir: &Path,
    by_path: &mut HashMap<String, DiskEntry>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // Sweeps run concurrently with walks.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_jobs(root, &path, by_path)?;
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let kind = match name {
            BUILD_LOG => PathKind::BuildLog,
            JUNIT_FAILURES => PathKind::Junit,
            _ => continue,
        };
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let Ok(rel) = path.strip_prefix(root) else { continue };
        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        // jobs/<bucket>/<trigger>/…/<job_name>/<build_id>/<file>
        let job_name = (segments.len() >= 3).then(|| segments[segments.len() - 3].clone());
        let trigger = segments.get(1).map(|s| Trigger::from_path_segment(s));
        let rel_path = format!("jobs/{}", segments.join("/"));
        by_path.insert(
            rel_path.clone(),
            DiskEntry {
                rel_path,
                kind,
                modified: modified.into(),
                job_name,
                trigger,
                bug_id: None,
            },
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Base for bug display URLs; the id lands in the query string.
    pub bug_url_base: Option<Url>,
    /// Base for issue display URLs; the id is appended to `browse/`.
    pub issue_url_base: Option<Url>,
    /// Base for job display URLs; the artifact path is appended.
    pub job_url_base: Option<Url>,
}

/// Translates corpus paths to metadata and queries to path sets.
pub struct PathResolver {
    corpus: Arc<Corpus>,
    /// Live stores per tracker dialect; disk mtimes are the fallback.
    bug_store: Option<Arc<Store<Bug>>>,
    issue_store: Option<Arc<Store<Bug>>>,
    index: RwLock<Arc<DiskIndex>>,
    config: ResolverConfig,
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver")
            .field("indexed_paths", &self.index.read().len())
            .finish()
    }
}

impl PathResolver {
    pub fn new(
        corpus: Arc<Corpus>,
        bug_store: Option<Arc<Store<Bug>>>,
        issue_store: Option<Arc<Store<Bug>>>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            corpus,
            bug_store,
            issue_store,
            index: RwLock::new(Arc::new(DiskIndex::default())),
            config,
        }
    }

    pub fn corpus_root(&self) -> &Path {
        self.corpus.root()
    }

    /// Rebuild the disk index from the current corpus tree.
    pub async fn refresh(&self) -> Result<usize> {
        let corpus = Arc::clone(&self.corpus);
        let index = tokio::task::spawn_blocking(move || DiskIndex::build(&corpus))
            .await
            .map_err(|err| SearchError::Internal(format!("index walk task: {err}")))??;
        let len = index.len();
        *self.index.write() = Arc::new(index);
        debug!("disk index refreshed: {len} paths");
        Ok(len)
    }

    /// Rich metadata for one corpus-relative path.
    pub fn metadata(&self, rel_path: &str) -> Result<PathMetadata> {
        if let Some(name) = rel_path.strip_prefix("bugs/") {
            let Some((dialect, id)) = parse_file_name(name) else {
                return Err(SearchError::NotFound(format!(
                    "not a bug path: {rel_path}"
                )));
            };
            let (store, display_url, display_name) = match dialect {
                crate::corpus::Dialect::Bug => {
                    (&self.bug_store, self.bug_display_url(id), format!("bug {id}"))
                }
                crate::corpus::Dialect::Issue => (
                    &self.issue_store,
                    self.issue_display_url(id),
                    format!("issue {id}"),
                ),
            };
            // Live store state is fresher than the last disk walk.
            let last_modified = match store.as_ref().and_then(|store| store.get(&id)) {
                Some(bug) => bug.last_activity(),
                None => {
                    let index = self.index.read();
                    let entry = index.get(rel_path).ok_or_else(|| {
                        SearchError::NotFound(format!("unindexed path: {rel_path}"))
                    })?;
                    entry.modified
                }
            };
            return Ok(PathMetadata {
                kind: PathKind::Bug,
                name: display_name,
                id: Some(id),
                display_url,
                last_modified,
                ignore_age: true,
                trigger: None,
            });
        }

        if rel_path.starts_with("jobs/") {
            let index = self.index.read();
            let entry = index
                .get(rel_path)
                .ok_or_else(|| SearchError::NotFound(format!("unindexed path: {rel_path}")))?;
            let name = entry
                .job_name
                .clone()
                .unwrap_or_else(|| rel_path.to_string());
            return Ok(PathMetadata {
                kind: entry.kind,
                name,
                id: None,
                display_url: self.job_display_url(rel_path),
                last_modified: entry.modified,
                ignore_age: false,
                trigger: entry.trigger,
            });
        }

        Err(SearchError::NotFound(format!(
            "unrecognized corpus path: {rel_path}"
        )))
    }

    fn bug_display_url(&self, id: u32) -> String {
        match &self.config.bug_url_base {
            Some(base) => format!("{base}show_bug.cgi?id={id}"),
            None => format!("bug/{id}"),
        }
    }

    fn issue_display_url(&self, id: u32) -> String {
        match &self.config.issue_url_base {
            Some(base) => format!("{base}browse/{id}"),
            None => format!("issue/{id}"),
        }
    }

    fn job_display_url(&self, rel_path: &str) -> String {
        // Drop the leading "jobs/<bucket>/" and the file name.
        let without_file = rel_path.rsplit_once('/').map(|(d, _)| d).unwrap_or(rel_path);
        let artifact_path = without_file
            .splitn(3, '/')
            .nth(2)
            .unwrap_or(without_file);
        match &self.config.job_url_base {
            Some(base) => format!("{base}{artifact_path}"),
            None => artifact_path.to_string(),
        }
    }

    /// Explicit path arguments for the engine, newest first. Bugs ignore
    /// `max_age`; job artifacts must fall within it. The job name filters
    /// only apply to job artifacts.
    pub fn restrict(
        &self,
        kind: IndexKind,
        max_age: Duration,
        job_filter: Option<&Regex>,
        exclude_filter: Option<&Regex>,
    ) -> Vec<PathBuf> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(14));
        let index = self.index.read();
        let mut selected: Vec<&DiskEntry> = index
            .by_path
            .values()
            .filter(|entry| match entry.kind {
                PathKind::Bug => kind.includes_bugs(),
                PathKind::Junit => kind.includes_junit(),
                PathKind::BuildLog => kind.includes_build_logs(),
            })
            .filter(|entry| entry.kind == PathKind::Bug || entry.modified >= cutoff)
            .filter(|entry| match (&entry.job_name, job_filter) {
                (Some(name), Some(filter)) => filter.is_match(name),
                _ => true,
            })
            .filter(|entry| match (&entry.job_name, exclude_filter) {
                (Some(name), Some(filter)) => !filter.is_match(name),
                _ => true,
            })
            .collect();
        selected.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.rel_path.cmp(&b.rel_path)));
        selected
            .into_iter()
            .map(|entry| self.corpus.root().join(&entry.rel_path))
            .collect()
    }
}
