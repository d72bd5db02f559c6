use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Terminal and in-flight states a CI job run can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Success,
    Failure,
    Error,
    Pending,
    Aborted,
    Triggered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Error => "error",
            JobState::Pending => "pending",
            JobState::Aborted => "aborted",
            JobState::Triggered => "triggered",
        }
    }

    /// A run that has finished and will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Error | JobState::Aborted
        )
    }

    /// Only failed runs contribute build-log tails to the corpus.
    pub fn is_failed(&self) -> bool {
        matches!(self, JobState::Failure | JobState::Error | JobState::Aborted)
    }
}

impl std::str::FromStr for JobState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "success" => Ok(JobState::Success),
            "failure" => Ok(JobState::Failure),
            "error" => Ok(JobState::Error),
            "pending" => Ok(JobState::Pending),
            "aborted" => Ok(JobState::Aborted),
            "triggered" => Ok(JobState::Triggered),
            other => Err(ModelError::UnknownJobState(other.to_string())),
        }
    }
}

/// The CI category that caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Pull,
    Build,
    Batch,
    Other,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Pull => "pull",
            Trigger::Build => "build",
            Trigger::Batch => "batch",
            Trigger::Other => "other",
        }
    }

    /// Map an upstream job type to a trigger category.
    pub fn from_job_type(s: &str) -> Trigger {
        match s.to_ascii_lowercase().as_str() {
            "presubmit" | "pull" => Trigger::Pull,
            "postsubmit" | "periodic" | "build" => Trigger::Build,
            "batch" => Trigger::Batch,
            _ => Trigger::Other,
        }
    }

    /// Map the object-storage path segment under which a run's artifacts
    /// live (`pr-logs` for pull runs, `logs` for everything merged).
    pub fn from_path_segment(s: &str) -> Trigger {
        match s {
            "pr-logs" => Trigger::Pull,
            "logs" => Trigger::Build,
            _ => Trigger::Other,
        }
    }
}

/// Identity of a run: (`job_name`, `build_id`) never collides across
/// sources.
pub type JobKey = (String, String);

/// One run of a CI job, merged from whichever source reported it last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_name: String,
    /// Stringified integer assigned by the CI system.
    pub build_id: String,
    pub state: JobState,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    /// Canonical detail page for the run.
    pub status_url: String,
    pub trigger: Trigger,
    /// Object-storage path (bucket-relative) holding the run's artifacts.
    pub artifact_prefix: String,
}

impl JobRun {
    pub fn key(&self) -> JobKey {
        (self.job_name.clone(), self.build_id.clone())
    }

    /// Conflict rule for the same run reported by two sources: the record
    /// with the later `completion_time` wins; an unset completion loses to
    /// any set one. Equal or both-unset keeps the incumbent.
    pub fn supersedes(&self, other: &JobRun) -> bool {
        match (self.completion_time, other.completion_time) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
