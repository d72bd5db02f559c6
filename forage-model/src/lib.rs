//! Core data model definitions shared across Forage crates.

pub mod bug;
pub mod error;
pub mod job;
pub mod query;

// Intentionally curated re-exports for downstream consumers.
pub use bug::{Bug, Comment, REDACTED_AUTHOR};
pub use error::{ModelError, Result as ModelResult};
pub use job::{JobKey, JobRun, JobState, Trigger};
pub use query::{GroupBy, IndexKind, PathKind, PathMetadata, SearchQuery};
