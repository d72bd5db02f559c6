//! The on-disk search corpus.
//!
//! A flat tree of plain-text files that the external regex engine scans
//! directly; being human-readable and grep-friendly is the point. Bugs
//! live under `bugs/`, job artifacts under `jobs/` echoing the upstream
//! object-storage layout. All writes publish atomically via a staging
//! file and rename, and every live file carries the entity's refresh
//! time as its modification time so the sweeper can age purely on mtime.

pub mod bugfile;
pub mod sweeper;
pub mod writer;

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, SearchError};

pub use bugfile::{Dialect, parse_bug, serialize_bug};
pub use sweeper::{SweepStats, Sweeper, SweeperConfig};
pub use writer::{BugPublisher, PublishOp};

/// Name of the marker holding the Unix timestamp of the last successful
/// index pass, kept inside the jobs tree.
const INDEXED_AT: &str = ".indexed-at";
/// Persisted object-storage index cursor.
const LAST_KEY: &str = ".last-key";

#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bugs_dir(&self) -> PathBuf {
        self.root.join("bugs")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn bug_path(&self, id: u32, dialect: Dialect) -> PathBuf {
        self.bugs_dir().join(format!("{}{id}", dialect.file_prefix()))
    }

    pub fn bug_staging_path(&self, id: u32, dialect: Dialect) -> PathBuf {
        self.bugs_dir()
            .join(format!("{}{id}", dialect.staging_prefix()))
    }

    /// Directory holding one run's derived artifacts. The path echoes the
    /// upstream layout: `jobs/<bucket>/<trigger>/…/<job_name>/<build_id>`.
    pub fn job_run_dir(&self, bucket: &str, artifact_prefix: &str) -> Result<PathBuf> {
        let mut dir = self.jobs_dir().join(sanitize_segment(bucket)?);
        for segment in artifact_prefix.split('/').filter(|s| !s.is_empty()) {
            dir.push(sanitize_segment(segment)?);
        }
        Ok(dir)
    }

    pub fn indexed_at_path(&self) -> PathBuf {
        self.jobs_dir().join(INDEXED_AT)
    }

    pub fn last_key_path(&self) -> PathBuf {
        self.jobs_dir().join(LAST_KEY)
    }

    pub async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.bugs_dir()).await?;
        tokio::fs::create_dir_all(self.jobs_dir()).await?;
        Ok(())
    }

    /// Unix timestamp of the last successful index pass, if recorded.
    pub async fn read_indexed_at(&self) -> Option<DateTime<Utc>> {
        let raw = tokio::fs::read_to_string(self.indexed_at_path()).await.ok()?;
        let secs = raw.trim().parse::<i64>().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    pub async fn write_indexed_at(&self, at: DateTime<Utc>) -> Result<()> {
        tokio::fs::write(self.indexed_at_path(), format!("{}\n", at.timestamp())).await?;
        Ok(())
    }
}

/// A path segment taken from remote input must stay a single segment.
fn sanitize_segment(segment: &str) -> Result<&str> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(SearchError::Malformed(format!(
            "unsafe path segment {segment:?}"
        )));
    }
    Ok(segment)
}
