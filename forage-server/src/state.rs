use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forage_core::resolve::PathResolver;
use forage_core::search::SearchExecutor;
use forage_core::sources::deck::JobsSnapshot;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<SearchExecutor>,
    pub resolver: Arc<PathResolver>,
    pub jobs: JobsSnapshot,
    /// Raw configuration file served back at `/config`, when given.
    pub config_path: Option<PathBuf>,
    /// Upper bound for per-query `maxAge`; the corpus holds nothing older.
    pub max_age_cap: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config_path", &self.config_path)
            .field("max_age_cap", &self.max_age_cap)
            .finish()
    }
}
