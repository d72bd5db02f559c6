//! The search endpoints: JSON at `/search`, HTML at `/`.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Json};
use forage_model::PathMetadata;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ApiError, ApiResult};
use crate::query::parse_search_query;
use crate::render;
use crate::state::AppState;

/// One retained match group in the JSON response.
#[derive(Debug, Clone, Serialize)]
pub struct MatchEntry {
    /// Kind of corpus file: `bug`, `junit`, or `build-log`.
    pub filename: String,
    /// Lossily decoded match and context lines.
    pub context: Vec<String>,
    /// Lines elided beyond the per-file cap.
    #[serde(rename = "moreLines", skip_serializing_if = "more_lines_is_zero")]
    pub more_lines: usize,
}

fn more_lines_is_zero(count: &usize) -> bool {
    *count == 0
}

/// `uri → pattern → [match]`.
pub type SearchResults = BTreeMap<String, BTreeMap<String, Vec<MatchEntry>>>;

/// Matches grouped per resolved entity, plus the metadata needed to
/// render or order them.
#[derive(Debug)]
pub struct AssembledSearch {
    pub results: SearchResults,
    pub metadata: HashMap<String, PathMetadata>,
    pub outcome: forage_core::search::SearchOutcome,
}

pub async fn run_search(
    state: &AppState,
    params: &[(String, String)],
) -> ApiResult<AssembledSearch> {
    let query = parse_search_query(params, state.max_age_cap)?;
    let cancel = CancellationToken::new();

    let mut results: SearchResults = BTreeMap::new();
    let mut metadata: HashMap<String, PathMetadata> = HashMap::new();
    let mut unresolved: std::collections::HashSet<String> = std::collections::HashSet::new();

    let resolver = state.resolver.clone();
    let outcome = state
        .executor
        .execute(&query, &cancel, |name, pattern, lines, elided| {
            if unresolved.contains(name) {
                return;
            }
            if !metadata.contains_key(name) {
                match resolver.metadata(name) {
                    Ok(meta) => {
                        metadata.insert(name.to_string(), meta);
                    }
                    Err(err) => {
                        // The sweeper may have removed the file mid-search.
                        debug!("dropping match for unresolvable path {name}: {err}");
                        unresolved.insert(name.to_string());
                        return;
                    }
                }
            }
            let meta = &metadata[name];
            let entry = MatchEntry {
                filename: meta.kind.as_str().to_string(),
                context: lines
                    .iter()
                    .map(|l| String::from_utf8_lossy(l).into_owned())
                    .collect(),
                more_lines: elided,
            };
            results
                .entry(meta.display_url.clone())
                .or_default()
                .entry(pattern.to_string())
                .or_default()
                .push(entry);
        })
        .await?;

    // Key the metadata by display URL too; renderers think in URIs.
    let by_uri: HashMap<String, PathMetadata> = metadata
        .into_values()
        .map(|meta| (meta.display_url.clone(), meta))
        .collect();

    Ok(AssembledSearch {
        results,
        metadata: by_uri,
        outcome,
    })
}

/// `GET /search`: JSON results, gzip-compressed by the response layer
/// when the client accepts it.
pub async fn search_json(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    let assembled = run_search(&state, &params).await?;
    debug!(
        "search returned {} matches across {} files ({} bytes{})",
        assembled.outcome.matches,
        assembled.outcome.files,
        assembled.outcome.bytes,
        if assembled.outcome.truncated {
            ", truncated"
        } else {
            ""
        }
    );
    Ok(Json(assembled.results))
}

/// `GET /`: the HTML results page.
pub async fn search_html(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<impl IntoResponse> {
    // An empty form load renders the landing page rather than a 400.
    if !params.iter().any(|(k, v)| k == "search" && !v.is_empty()) {
        return Ok(Html(render::landing_page()));
    }
    let query = parse_search_query(&params, state.max_age_cap)?;
    let assembled = run_search(&state, &params).await?;
    render::results_page(&query, &assembled)
        .map(Html)
        .map_err(|err| ApiError::internal(format!("rendering results: {err}")))
}
