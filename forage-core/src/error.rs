use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("watch expired: {0}")]
    Expired(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        SearchError::Remote(err.to_string())
    }
}

impl From<forage_model::ModelError> for SearchError {
    fn from(err: forage_model::ModelError) -> Self {
        SearchError::Malformed(err.to_string())
    }
}

impl SearchError {
    /// Transient failures are retried through the rate-limited queue and
    /// never surfaced to users.
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Remote(_) | SearchError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
