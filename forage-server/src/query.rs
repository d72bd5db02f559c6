//! HTTP query-string to [`SearchQuery`] translation.
//!
//! Every violation maps to a 400 carrying the specific field and reason;
//! nothing here mutates state.

use std::time::Duration;

use forage_model::{GroupBy, IndexKind, SearchQuery};

use crate::errors::ApiError;

/// Parse the shared `/search` and `/` parameter set. `max_age_cap` bounds
/// how far back a query may reach regardless of what it asks for.
pub fn parse_search_query(
    params: &[(String, String)],
    max_age_cap: Duration,
) -> Result<SearchQuery, ApiError> {
    let mut query = SearchQuery {
        max_age: Duration::from_secs(48 * 3600).min(max_age_cap),
        ..SearchQuery::default()
    };

    for (key, value) in params {
        match key.as_str() {
            "search" => query.patterns.push(value.clone()),
            "type" => {
                query.kind = value
                    .parse::<IndexKind>()
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
            }
            "name" => {
                if !value.is_empty() {
                    query.job_filter = Some(value.clone());
                }
            }
            "excludeName" => {
                if !value.is_empty() {
                    query.exclude_filter = Some(value.clone());
                }
            }
            "context" => {
                query.context_lines = value.parse::<i32>().map_err(|_| {
                    ApiError::bad_request(format!("context must be an integer, got {value:?}"))
                })?;
            }
            "maxAge" => {
                let age = parse_age(value)?;
                // Zero means "no preference": fall back to the cap.
                query.max_age = if age.is_zero() {
                    max_age_cap
                } else {
                    age.min(max_age_cap)
                };
            }
            "maxMatches" => {
                query.max_matches_per_file = value.parse::<usize>().map_err(|_| {
                    ApiError::bad_request(format!("maxMatches must be an integer, got {value:?}"))
                })?;
            }
            "maxBytes" => {
                query.max_bytes = value.parse::<usize>().map_err(|_| {
                    ApiError::bad_request(format!("maxBytes must be an integer, got {value:?}"))
                })?;
            }
            "groupBy" => {
                query.group_by = value
                    .parse::<GroupBy>()
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
            }
            // Unknown parameters are ignored so dashboards can add their
            // own bookmarkable state.
            _ => {}
        }
    }

    query.validate()?;
    Ok(query)
}

fn parse_age(value: &str) -> Result<Duration, ApiError> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value)
        .map_err(|err| ApiError::bad_request(format!("maxAge {value:?}: {err}")))
}
