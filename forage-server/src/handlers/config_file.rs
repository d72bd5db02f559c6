//! `GET /config`: the raw configuration file, or 204 when none was given.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn serve_config(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let Some(path) = &state.config_path else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let raw = tokio::fs::read(path)
        .await
        .map_err(|err| ApiError::internal(format!("reading config: {err}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        raw,
    )
        .into_response())
}
