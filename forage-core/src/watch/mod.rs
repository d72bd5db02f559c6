//! Change-event streams over remote sources.
//!
//! A [`Watcher`] exposes a paginated consistent listing and a cooperative
//! event stream. The only required implementation is the
//! [`periodic::PeriodicWatcher`], which turns a poll-based lister into a
//! watch stream with a monotonically advancing resource token.

pub mod periodic;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SearchError};

/// Resource-version-like token: the maximum `last_changed_at` observed.
pub type ResourceToken = DateTime<Utc>;

/// One observed change. `Error` carries the underlying cause; after an
/// error the stream closes and the consumer must relist.
#[derive(Debug)]
pub enum WatchEvent<V> {
    Added(Arc<V>),
    Modified(Arc<V>),
    Error(SearchError),
}

/// One page of a consistent listing.
#[derive(Debug)]
pub struct ListPage<V> {
    pub items: Vec<V>,
    /// Opaque continuation; `None` when the listing is exhausted.
    pub next_token: Option<String>,
    /// Maximum `last_changed_at` across the returned items.
    pub high_watermark: ResourceToken,
}

/// A bounded receiver of watch events. Dropping it cancels the producer.
#[derive(Debug)]
pub struct WatchStream<V> {
    rx: mpsc::Receiver<WatchEvent<V>>,
}

impl<V> WatchStream<V> {
    pub fn new(rx: mpsc::Receiver<WatchEvent<V>>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the stream has closed.
    pub async fn next(&mut self) -> Option<WatchEvent<V>> {
        self.rx.recv().await
    }
}

/// A source of ordered change events and consistent list snapshots.
#[async_trait]
pub trait Watcher<V: Send + Sync + 'static>: Send + Sync {
    /// Paginated consistent listing.
    async fn list(&self, continue_token: Option<String>, limit: usize) -> Result<ListPage<V>>;

    /// Stream of events observed strictly after `since`. The stream ends
    /// with an `Error` event on transport failure or watch expiry.
    async fn watch(
        &self,
        since: ResourceToken,
        cancel: CancellationToken,
    ) -> Result<WatchStream<V>>;
}

/// Epoch token: watch everything.
pub fn zero_token() -> ResourceToken {
    DateTime::<Utc>::UNIX_EPOCH
}
