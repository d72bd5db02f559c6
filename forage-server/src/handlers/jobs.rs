//! `GET /jobs`: passthrough of the most recent job-list payload.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    match state.jobs.get() {
        Some(raw) => Ok((
            [(header::CONTENT_TYPE, "application/json")],
            raw.as_ref().clone(),
        )),
        None => Err(ApiError::unavailable("job list not fetched yet")),
    }
}
