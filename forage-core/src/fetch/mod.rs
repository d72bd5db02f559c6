//! Artifact fetch pipelines.
//!
//! Keys flow from store event handlers into deduplicating work queues;
//! worker loops drain them in rate-limited batches, call the remote
//! source, merge results back into the store, and hand entity ids to the
//! corpus writer.

pub mod artifacts;
pub mod comments;
pub mod junit;
pub mod queue;
pub mod ratelimit;

pub use artifacts::{ArtifactClient, ArtifactEntry, ArtifactFetcher, ArtifactFetcherConfig};
pub use comments::{CommentClient, CommentFetcher, CommentFetcherConfig};
pub use queue::{WorkQueue, WorkQueueConfig};
pub use ratelimit::TokenBucket;
