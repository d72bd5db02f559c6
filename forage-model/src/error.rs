use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid query parameter `{field}`: {reason}")]
    InvalidQuery { field: &'static str, reason: String },

    #[error("unrecognized job state: {0}")]
    UnknownJobState(String),

    #[error("unrecognized trigger: {0}")]
    UnknownTrigger(String),

    #[error("malformed job link: {0}")]
    MalformedLink(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
