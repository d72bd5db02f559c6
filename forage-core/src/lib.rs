//! Indexing and caching substrate for the Forage CI search service.
//!
//! The crate is organized along the data flow: [`watch`] produces change
//! events from remote sources, [`store`] reflects them into keyed in-memory
//! stores, [`fetch`] materializes artifacts, [`corpus`] owns the on-disk
//! search tree, [`resolve`] maps corpus paths back to entities, and
//! [`search`] drives the external regex engine over the corpus.

pub mod corpus;
pub mod error;
pub mod fetch;
pub mod resolve;
pub mod search;
pub mod sources;
pub mod store;
pub mod watch;

pub use error::{Result, SearchError};
pub use store::{Keyed, Store, StoreEvent};
pub use watch::{ResourceToken, WatchEvent, Watcher};
