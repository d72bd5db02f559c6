//! REST client for the bug tracker.
//!
//! Listings are offset-paginated and filtered by `last_change_time` with
//! an enumerated field list to bound payload size. Comment bodies come
//! from a separate batched endpoint so the watcher stays cheap.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use forage_model::{Bug, Comment};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::{Result, SearchError};
use crate::sources::with_retries;
use crate::watch::ResourceToken;
use crate::watch::periodic::ChangeLister;

const TRACKER_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Fields requested from the listing endpoint; comment bodies are fetched
/// separately in batches.
const INCLUDE_FIELDS: &str = "id,summary,status,resolution,severity,priority,creator,\
                              assigned_to,keywords,whiteboard,cf_internal_whiteboard,\
                              target_release,component,cf_environment,creation_time,\
                              last_change_time";

#[derive(Debug, Clone)]
pub enum TrackerAuth {
    Anonymous,
    Bearer(String),
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub base_url: Url,
    pub auth: TrackerAuth,
    /// Optional quicksearch expression restricting which bugs are indexed.
    pub search: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    config: TrackerConfig,
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SearchError::Internal(format!("building tracker client: {err}")))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|err| SearchError::Internal(format!("tracker url: {err}")))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            TrackerAuth::Anonymous => req,
            TrackerAuth::Bearer(token) => req.bearer_auth(token),
            TrackerAuth::ApiKey(key) => req.header("X-API-Key", key),
        }
    }

    /// One page of bugs changed strictly after `since`.
    pub async fn bugs_changed_since(
        &self,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bug>> {
        let url = self.endpoint("rest/bug")?;
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let offset = offset.to_string();
        let limit = limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("include_fields", INCLUDE_FIELDS),
            ("last_change_time", &since),
            ("offset", &offset),
            ("limit", &limit),
        ];
        if let Some(search) = &self.config.search {
            params.push(("quicksearch", search));
        }

        let response = self
            .apply_auth(self.http.get(url).query(&params))
            .send()
            .await?
            .error_for_status()?;
        let listing: BugListResponse = response.json().await?;

        let refresh = Utc::now();
        let mut bugs = Vec::with_capacity(listing.bugs.len());
        for raw in listing.bugs {
            match raw.into_bug(refresh) {
                Ok(bug) => bugs.push(bug),
                Err(err) => warn!("dropping malformed bug record: {err}"),
            }
        }
        Ok(bugs)
    }

    /// Batched comment fetch; the response maps bug id to its full
    /// comment list in creation order.
    pub async fn comments_batch(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Comment>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.endpoint("rest/bug/comment")?;
        let mut params: Vec<(&str, String)> =
            ids.iter().map(|id| ("ids", id.to_string())).collect();
        params.push(("include_fields", "id,creator,creation_time,text,is_private".to_string()));

        let response = self
            .apply_auth(self.http.get(url).query(&params))
            .send()
            .await?
            .error_for_status()?;
        let payload: CommentsResponse = response.json().await?;

        let mut result = HashMap::with_capacity(payload.bugs.len());
        for (id, entry) in payload.bugs {
            let Ok(id) = id.parse::<u32>() else {
                warn!("dropping comments for unparseable bug id {id:?}");
                continue;
            };
            let mut comments = Vec::with_capacity(entry.comments.len());
            for raw in entry.comments {
                match raw.into_comment() {
                    Ok(comment) => comments.push(comment),
                    Err(err) => warn!("dropping malformed comment on bug {id}: {err}"),
                }
            }
            result.insert(id, comments);
        }
        Ok(result)
    }
}

#[async_trait]
impl ChangeLister<Bug> for TrackerClient {
    async fn changed_since(
        &self,
        since: ResourceToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bug>> {
        with_retries(TRACKER_RETRIES, RETRY_BASE_DELAY, || {
            self.bugs_changed_since(since, offset, limit)
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct BugListResponse {
    #[serde(default)]
    bugs: Vec<RawBug>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBug {
    id: u32,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    resolution: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    creator: String,
    #[serde(default)]
    assigned_to: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    whiteboard: String,
    #[serde(default)]
    cf_internal_whiteboard: String,
    #[serde(default)]
    target_release: Vec<String>,
    #[serde(default)]
    component: Vec<String>,
    #[serde(default)]
    cf_environment: String,
    creation_time: Option<DateTime<Utc>>,
    last_change_time: Option<DateTime<Utc>>,
}

impl RawBug {
    fn into_bug(self, refresh_time: DateTime<Utc>) -> Result<Bug> {
        let last_changed_at = self.last_change_time.ok_or_else(|| {
            SearchError::Malformed(format!("bug {} missing last_change_time", self.id))
        })?;
        Ok(Bug {
            id: self.id,
            summary: self.summary,
            status: self.status,
            resolution: self.resolution,
            severity: self.severity,
            priority: self.priority,
            creator: self.creator,
            assignee: self.assigned_to,
            keywords: self.keywords,
            whiteboard: self.whiteboard,
            internal_whiteboard: self.cf_internal_whiteboard,
            target_release: self.target_release,
            component: self.component,
            environment: self.cf_environment,
            created_at: self.creation_time.unwrap_or(last_changed_at),
            last_changed_at,
            comments: Vec::new(),
            refresh_time,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    bugs: HashMap<String, BugComments>,
}

#[derive(Debug, Deserialize)]
struct BugComments {
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawComment {
    id: Option<u64>,
    #[serde(default)]
    creator: String,
    creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_private: bool,
}

impl RawComment {
    fn into_comment(self) -> Result<Comment> {
        let id = self
            .id
            .ok_or_else(|| SearchError::Malformed("comment missing id".to_string()))?;
        let created_at = self.creation_time.ok_or_else(|| {
            SearchError::Malformed(format!("comment {id} missing creation_time"))
        })?;
        Ok(Comment {
            id,
            author: self.creator,
            created_at,
            body: self.text,
            private: self.is_private,
        })
    }
}
