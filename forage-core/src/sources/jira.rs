//! REST client for a Jira-style issue tracker.
//!
//! Structurally the same contract as the bug tracker: a JQL-filtered,
//! offset-paginated listing plus comment retrieval. Issues map onto the
//! shared [`Bug`] model (numeric id, priority instead of severity,
//! labels instead of keywords) and serialize through the corpus issue
//! dialect.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forage_model::{Bug, Comment};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::{Result, SearchError};
use crate::fetch::comments::CommentClient;
use crate::sources::with_retries;
use crate::watch::ResourceToken;
use crate::watch::periodic::ChangeLister;

const JIRA_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

const LIST_FIELDS: &str =
    "summary,status,resolution,priority,creator,assignee,labels,fixVersions,components,\
     created,updated";

#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub base_url: Url,
    /// Bearer token; anonymous when unset.
    pub token: Option<String>,
    /// JQL clause ANDed into every listing, e.g. a project filter.
    pub search: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JiraClient {
    config: JiraConfig,
    http: reqwest::Client,
}

impl JiraClient {
    pub fn new(config: JiraConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SearchError::Internal(format!("building jira client: {err}")))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|err| SearchError::Internal(format!("jira url: {err}")))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn jql_since(&self, since: DateTime<Utc>) -> String {
        // JQL minute resolution rounds down so a boundary change is seen
        // twice rather than never.
        let mut jql = format!(
            "updated >= \"{}\" ORDER BY updated ASC",
            since.format("%Y-%m-%d %H:%M")
        );
        if let Some(filter) = &self.config.search {
            jql = format!("({filter}) AND {jql}");
        }
        jql
    }

    /// One page of issues updated after `since`.
    pub async fn issues_changed_since(
        &self,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bug>> {
        let url = self.endpoint("rest/api/2/search")?;
        let jql = self.jql_since(since);
        let offset = offset.to_string();
        let limit = limit.to_string();
        let params: Vec<(&str, &str)> = vec![
            ("jql", &jql),
            ("fields", LIST_FIELDS),
            ("startAt", &offset),
            ("maxResults", &limit),
        ];
        let response = self
            .apply_auth(self.http.get(url).query(&params))
            .send()
            .await?
            .error_for_status()?;
        let listing: IssueListResponse = response.json().await?;

        let refresh = Utc::now();
        let mut issues = Vec::with_capacity(listing.issues.len());
        for raw in listing.issues {
            match raw.into_bug(refresh) {
                Ok(issue) => issues.push(issue),
                Err(err) => warn!("dropping malformed issue record: {err}"),
            }
        }
        // The since filter is minute-granular; enforce the contract here.
        issues.retain(|issue| issue.last_changed_at > since);
        Ok(issues)
    }

    /// Comments for one issue, in creation order.
    pub async fn issue_comments(&self, id: u32) -> Result<Vec<Comment>> {
        let url = self.endpoint(&format!("rest/api/2/issue/{id}/comment"))?;
        let response = self
            .apply_auth(self.http.get(url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SearchError::NotFound(format!("issue {id}")));
        }
        let payload: CommentListResponse = response.error_for_status()?.json().await?;

        let mut comments = Vec::with_capacity(payload.comments.len());
        for raw in payload.comments {
            match raw.into_comment() {
                Ok(comment) => comments.push(comment),
                Err(err) => warn!("dropping malformed comment on issue {id}: {err}"),
            }
        }
        Ok(comments)
    }
}

#[async_trait]
impl ChangeLister<Bug> for JiraClient {
    async fn changed_since(
        &self,
        since: ResourceToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bug>> {
        with_retries(JIRA_RETRIES, RETRY_BASE_DELAY, || {
            self.issues_changed_since(since, offset, limit)
        })
        .await
    }
}

/// The issue API has no batch comment call; the token bucket in front of
/// the fetcher still bounds the request rate.
#[async_trait]
impl CommentClient for JiraClient {
    async fn comments_batch(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Comment>>> {
        let mut result = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.issue_comments(*id).await {
                Ok(comments) => {
                    result.insert(*id, comments);
                }
                // Absent issues are simply missing from the response,
                // mirroring the batch endpoint's shape.
                Err(SearchError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct IssueListResponse {
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawIssue {
    /// Numeric in the API, delivered as a string.
    id: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    fields: RawIssueFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawIssueFields {
    #[serde(default)]
    summary: String,
    status: Option<Named>,
    resolution: Option<Named>,
    priority: Option<Named>,
    creator: Option<Person>,
    assignee: Option<Person>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default, rename = "fixVersions")]
    fix_versions: Vec<Named>,
    #[serde(default)]
    components: Vec<Named>,
    created: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Named {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Person {
    #[serde(default, rename = "displayName")]
    display_name: String,
}

const JIRA_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

fn parse_jira_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(raw, JIRA_TIME_FORMAT)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| SearchError::Malformed(format!("issue timestamp {raw:?}: {err}")))
}

impl RawIssue {
    fn into_bug(self, refresh_time: DateTime<Utc>) -> Result<Bug> {
        let id = self
            .id
            .parse::<u32>()
            .map_err(|_| SearchError::Malformed(format!("issue id {:?} is not numeric", self.id)))?;
        let updated = self
            .fields
            .updated
            .as_deref()
            .ok_or_else(|| SearchError::Malformed(format!("issue {} missing updated", self.key)))
            .and_then(parse_jira_time)?;
        let created = match self.fields.created.as_deref() {
            Some(raw) => parse_jira_time(raw)?,
            None => updated,
        };
        let summary = if self.key.is_empty() {
            self.fields.summary
        } else {
            format!("{}: {}", self.key, self.fields.summary)
        };
        Ok(Bug {
            id,
            summary,
            status: self.fields.status.map(|n| n.name).unwrap_or_default(),
            resolution: self.fields.resolution.map(|n| n.name).unwrap_or_default(),
            severity: String::new(),
            priority: self.fields.priority.map(|n| n.name).unwrap_or_default(),
            creator: self.fields.creator.map(|p| p.display_name).unwrap_or_default(),
            assignee: self
                .fields
                .assignee
                .map(|p| p.display_name)
                .unwrap_or_default(),
            keywords: self.fields.labels,
            whiteboard: String::new(),
            internal_whiteboard: String::new(),
            target_release: self.fields.fix_versions.into_iter().map(|n| n.name).collect(),
            component: self.fields.components.into_iter().map(|n| n.name).collect(),
            environment: String::new(),
            created_at: created,
            last_changed_at: updated,
            comments: Vec::new(),
            refresh_time,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommentListResponse {
    #[serde(default)]
    comments: Vec<RawIssueComment>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawIssueComment {
    id: Option<String>,
    author: Option<Person>,
    #[serde(default)]
    body: String,
    created: Option<String>,
    /// Visibility-restricted comments are treated like private ones.
    visibility: Option<serde_json::Value>,
}

impl RawIssueComment {
    fn into_comment(self) -> Result<Comment> {
        let id = self
            .id
            .as_deref()
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| SearchError::Malformed("comment missing numeric id".to_string()))?;
        let created_at = self
            .created
            .as_deref()
            .ok_or_else(|| SearchError::Malformed(format!("comment {id} missing created")))
            .and_then(parse_jira_time)?;
        Ok(Comment {
            id,
            author: self.author.map(|p| p.display_name).unwrap_or_default(),
            created_at,
            body: self.body,
            private: self.visibility.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_issue_listing_parses() {
        let payload = r#"{
            "issues": [
                {
                    "id": "10181",
                    "key": "NET-42",
                    "fields": {
                        "summary": "DNS flake in e2e",
                        "status": {"name": "In Progress"},
                        "priority": {"name": "Blocker"},
                        "creator": {"displayName": "R. Eporter"},
                        "labels": ["flake"],
                        "fixVersions": [{"name": "4.19"}],
                        "components": [{"name": "dns"}],
                        "created": "2026-07-01T10:00:00.000+0000",
                        "updated": "2026-07-02T11:30:00.000+0000"
                    }
                },
                {
                    "id": "not-numeric",
                    "key": "BAD-1",
                    "fields": {"updated": "2026-07-02T11:30:00.000+0000"}
                }
            ]
        }"#;
        let listing: IssueListResponse = serde_json::from_str(payload).unwrap();
        let refresh = Utc::now();

        let issue = listing.issues[0].clone().into_bug(refresh).unwrap();
        assert_eq!(issue.id, 10181);
        assert_eq!(issue.summary, "NET-42: DNS flake in e2e");
        assert_eq!(issue.status, "In Progress");
        assert_eq!(issue.priority, "Blocker");
        assert_eq!(issue.severity, "");
        assert_eq!(issue.keywords, vec!["flake".to_string()]);
        assert_eq!(issue.target_release, vec!["4.19".to_string()]);
        assert_eq!(
            issue.last_changed_at,
            Utc.with_ymd_and_hms(2026, 7, 2, 11, 30, 0).unwrap()
        );

        assert!(listing.issues[1].clone().into_bug(refresh).is_err());
    }

    #[test]
    fn test_comment_visibility_marks_private() {
        let payload = r#"{
            "comments": [
                {
                    "id": "77",
                    "author": {"displayName": "D. Ev"},
                    "body": "seen on 4.19 too",
                    "created": "2026-07-02T11:00:00.000+0000"
                },
                {
                    "id": "78",
                    "author": {"displayName": "S. Ecret"},
                    "body": "internal details",
                    "created": "2026-07-02T11:05:00.000+0000",
                    "visibility": {"type": "role", "value": "Employees"}
                }
            ]
        }"#;
        let listing: CommentListResponse = serde_json::from_str(payload).unwrap();
        let first = listing.comments[0].clone().into_comment().unwrap();
        assert!(!first.private);
        assert_eq!(first.body, "seen on 4.19 too");
        let second = listing.comments[1].clone().into_comment().unwrap();
        assert!(second.private);
    }

    #[test]
    fn test_jql_composition() {
        let client = JiraClient::new(JiraConfig {
            base_url: Url::parse("https://issues.example.com/").unwrap(),
            token: None,
            search: Some("project = NET".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let since = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap();
        assert_eq!(
            client.jql_since(since),
            "(project = NET) AND updated >= \"2026-08-01 09:30\" ORDER BY updated ASC"
        );
    }
}
