use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::job::Trigger;

/// Which slice of the corpus a search runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Bug,
    Junit,
    BuildLog,
    BugJunit,
    All,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Bug => "bug",
            IndexKind::Junit => "junit",
            IndexKind::BuildLog => "build-log",
            IndexKind::BugJunit => "bug+junit",
            IndexKind::All => "all",
        }
    }

    pub fn includes_bugs(&self) -> bool {
        matches!(self, IndexKind::Bug | IndexKind::BugJunit | IndexKind::All)
    }

    pub fn includes_junit(&self) -> bool {
        matches!(self, IndexKind::Junit | IndexKind::BugJunit | IndexKind::All)
    }

    pub fn includes_build_logs(&self) -> bool {
        matches!(self, IndexKind::BuildLog | IndexKind::All)
    }
}

impl std::str::FromStr for IndexKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bug" | "issue" => Ok(IndexKind::Bug),
            "junit" => Ok(IndexKind::Junit),
            "build-log" => Ok(IndexKind::BuildLog),
            "bug+junit" | "issue+junit" => Ok(IndexKind::BugJunit),
            "all" => Ok(IndexKind::All),
            other => Err(ModelError::InvalidQuery {
                field: "type",
                reason: format!("unrecognized index type {other:?}"),
            }),
        }
    }
}

/// Result grouping requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    #[default]
    Job,
    None,
}

impl std::str::FromStr for GroupBy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "job" => Ok(GroupBy::Job),
            "none" => Ok(GroupBy::None),
            other => Err(ModelError::InvalidQuery {
                field: "groupBy",
                reason: format!("unrecognized grouping {other:?}"),
            }),
        }
    }
}

pub const MAX_CONTEXT_LINES: i32 = 15;
pub const MAX_MATCHES_CAP: usize = 1000;

/// A fully-specified search request as the executor consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// One or more regex patterns; each runs as its own engine invocation.
    pub patterns: Vec<String>,
    /// -1 reports matches as whole-path-only, 0..=15 lines of context.
    pub context_lines: i32,
    /// Cap per (file, pattern).
    pub max_matches_per_file: usize,
    /// Hard ceiling on aggregate bytes delivered to the caller.
    pub max_bytes: usize,
    pub kind: IndexKind,
    pub max_age: Duration,
    /// Regex restricting job names; bugs always pass.
    pub job_filter: Option<String>,
    /// Regex excluding job names.
    pub exclude_filter: Option<String>,
    pub group_by: GroupBy,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            context_lines: 2,
            max_matches_per_file: 5,
            max_bytes: 20 * 1024 * 1024,
            kind: IndexKind::All,
            max_age: Duration::from_secs(48 * 3600),
            job_filter: None,
            exclude_filter: None,
            group_by: GroupBy::Job,
        }
    }
}

impl SearchQuery {
    /// Field-level validation; regex compilation happens at the edge where
    /// the regex engine is available.
    pub fn validate(&self) -> Result<()> {
        if self.patterns.is_empty() {
            return Err(ModelError::InvalidQuery {
                field: "search",
                reason: "at least one pattern is required".to_string(),
            });
        }
        for p in &self.patterns {
            if p.is_empty() {
                return Err(ModelError::InvalidQuery {
                    field: "search",
                    reason: "empty pattern".to_string(),
                });
            }
        }
        if self.context_lines < -1 || self.context_lines > MAX_CONTEXT_LINES {
            return Err(ModelError::InvalidQuery {
                field: "context",
                reason: format!(
                    "context must be between -1 and {MAX_CONTEXT_LINES}, got {}",
                    self.context_lines
                ),
            });
        }
        if self.max_matches_per_file == 0 || self.max_matches_per_file > MAX_MATCHES_CAP {
            return Err(ModelError::InvalidQuery {
                field: "maxMatches",
                reason: format!(
                    "maxMatches must be between 1 and {MAX_MATCHES_CAP}, got {}",
                    self.max_matches_per_file
                ),
            });
        }
        if self.max_bytes == 0 {
            return Err(ModelError::InvalidQuery {
                field: "maxBytes",
                reason: "maxBytes must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// What kind of corpus file a resolved path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathKind {
    Bug,
    BuildLog,
    Junit,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::Bug => "bug",
            PathKind::BuildLog => "build-log",
            PathKind::Junit => "junit",
        }
    }
}

/// Rich metadata for a corpus-relative path, resolved for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMetadata {
    pub kind: PathKind,
    /// Display name: the job name, or `bug <id>`.
    pub name: String,
    /// Bug id when the path is a bug file.
    pub id: Option<u32>,
    pub display_url: String,
    pub last_modified: DateTime<Utc>,
    /// Bugs are displayed regardless of age.
    pub ignore_age: bool,
    pub trigger: Option<Trigger>,
}
