use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<forage_core::SearchError> for ApiError {
    fn from(err: forage_core::SearchError) -> Self {
        use forage_core::SearchError;
        match err {
            // User input problems surface with the precise violation.
            SearchError::Malformed(msg) => Self::bad_request(msg),
            SearchError::Cancelled(msg) => {
                Self::new(StatusCode::REQUEST_TIMEOUT, format!("cancelled: {msg}"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<forage_model::ModelError> for ApiError {
    fn from(err: forage_model::ModelError) -> Self {
        Self::bad_request(err.to_string())
    }
}
