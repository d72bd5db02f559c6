//! Object-storage job index scanner.
//!
//! Finished jobs write a zero-byte object under a virtual index prefix;
//! the object name sorts as an RFC-3339 timestamp followed by an opaque
//! key, and its metadata carries `{link, state, completed}`. The scanner
//! walks the prefix in adaptive timestamp buckets from a persisted
//! `from_key`, so a restart resumes where the previous process stopped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use forage_model::{JobRun, JobState, Trigger};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SearchError};
use crate::sources::{merge_job_run, with_retries};
use crate::store::Store;

const LIST_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_LIST_RESULTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct ObjStoreConfig {
    /// JSON listing API base, e.g. `https://storage.googleapis.com/storage/v1/`.
    pub api_base: Url,
    pub bucket: String,
    /// Virtual prefix the index objects live under.
    pub index_prefix: String,
    pub timeout: Duration,
}

/// Minimal object-storage client: prefix listings and ranged reads.
#[derive(Debug, Clone)]
pub struct ObjStoreClient {
    config: ObjStoreConfig,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList {
    #[serde(default)]
    pub items: Vec<RawObject>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawObject {
    pub name: String,
    /// Custom metadata attributes; object sizes arrive as strings.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl ObjStoreClient {
    pub fn new(config: ObjStoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SearchError::Internal(format!("building storage client: {err}")))?;
        Ok(Self { config, http })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn listing_url(&self) -> Result<Url> {
        self.config
            .api_base
            .join(&format!("b/{}/o", self.config.bucket))
            .map_err(|err| SearchError::Internal(format!("storage url: {err}")))
    }

    /// One listing page under `prefix`, starting at `start_offset`.
    pub async fn list_objects(
        &self,
        prefix: &str,
        start_offset: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ObjectList> {
        let url = self.listing_url()?;
        let max_results = MAX_LIST_RESULTS.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("prefix", prefix),
            ("maxResults", &max_results),
            ("fields", "items(name,metadata,size),nextPageToken"),
        ];
        if let Some(offset) = start_offset {
            params.push(("startOffset", offset));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let response = self
            .http
            .get(url)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Download at most the last `max_bytes` of an object via a suffix
    /// range request.
    pub async fn download_tail(&self, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let url = self
            .config
            .api_base
            .join(&format!(
                "b/{}/o/{}",
                self.config.bucket,
                urlencode(name)
            ))
            .map_err(|err| SearchError::Internal(format!("storage url: {err}")))?;
        let response = self
            .http
            .get(url)
            .query(&[("alt", "media")])
            .header("Range", format!("bytes=-{max_bytes}"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SearchError::NotFound(name.to_string()));
        }
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Percent-encode an object name for the JSON API path.
fn urlencode(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Timestamp-bucketed listing prefixes covering `[from, to]`, chosen so
/// each listing call stays small: day buckets for long spans, hour
/// buckets for medium ones, ten-minute buckets otherwise.
pub fn scan_prefixes(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
    let mut prefixes = Vec::new();
    if to < from {
        return prefixes;
    }
    let span = to - from;
    if span > chrono::Duration::hours(48) {
        let mut day = from.date_naive();
        while day <= to.date_naive() {
            prefixes.push(day.format("%Y-%m-%d").to_string());
            day = day.succ_opt().expect("date overflow");
        }
    } else if span > chrono::Duration::hours(4) {
        let mut cursor = Utc
            .with_ymd_and_hms(from.year(), from.month(), from.day(), from.hour(), 0, 0)
            .single()
            .expect("valid hour truncation");
        while cursor <= to {
            prefixes.push(cursor.format("%Y-%m-%dT%H").to_string());
            cursor += chrono::Duration::hours(1);
        }
    } else {
        let minute = from.minute() - from.minute() % 10;
        let mut cursor = Utc
            .with_ymd_and_hms(from.year(), from.month(), from.day(), from.hour(), minute, 0)
            .single()
            .expect("valid minute truncation");
        while cursor <= to {
            // Ten-minute bucket: drop the final minute digit.
            let stamp = cursor.format("%Y-%m-%dT%H:%M").to_string();
            prefixes.push(stamp[..stamp.len() - 1].to_string());
            cursor += chrono::Duration::minutes(10);
        }
    }
    prefixes
}

/// Parse an index object into a partial [`JobRun`]. The object name ends
/// in `<rfc3339>-<opaque>`; `link` points at the run's artifact prefix.
pub fn parse_index_object(object: &RawObject) -> Result<JobRun> {
    let base = object
        .name
        .rsplit('/')
        .next()
        .unwrap_or(&object.name);
    if base.len() < 20 {
        return Err(SearchError::Malformed(format!(
            "index object name too short: {base:?}"
        )));
    }
    let completed_fallback = DateTime::parse_from_rfc3339(&base[..20])
        .map_err(|err| SearchError::Malformed(format!("index object timestamp: {err}")))?
        .with_timezone(&Utc);

    let link = object
        .metadata
        .get("link")
        .ok_or_else(|| SearchError::Malformed(format!("object {} missing link", object.name)))?;
    let (job_name, build_id, trigger, artifact_prefix) = parse_job_link(link)?;

    let state = object
        .metadata
        .get("state")
        .map(|s| s.parse::<JobState>())
        .transpose()?
        .unwrap_or(JobState::Failure);
    let completion_time = match object.metadata.get("completed") {
        Some(stamp) => DateTime::parse_from_rfc3339(stamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(completed_fallback),
        None => completed_fallback,
    };

    Ok(JobRun {
        job_name,
        build_id,
        state,
        start_time: None,
        completion_time: Some(completion_time),
        status_url: link.clone(),
        trigger,
        artifact_prefix,
    })
}

/// Split a `gs://bucket/...` (or plain path) link into job identity and
/// the bucket-relative artifact prefix.
fn parse_job_link(link: &str) -> Result<(String, String, Trigger, String)> {
    let path = link
        .strip_prefix("gs://")
        .map(|rest| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
        .unwrap_or(link.trim_start_matches('/'));
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return Err(SearchError::Malformed(format!("job link too short: {link:?}")));
    }
    let build_id = segments[segments.len() - 1];
    let job_name = segments[segments.len() - 2];
    if build_id.is_empty() || !build_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SearchError::Malformed(format!(
            "job link build id is not numeric: {link:?}"
        )));
    }
    let trigger = Trigger::from_path_segment(segments[0]);
    Ok((
        job_name.to_string(),
        build_id.to_string(),
        trigger,
        segments.join("/"),
    ))
}

#[derive(Debug, Clone)]
pub struct IndexScannerConfig {
    pub interval: Duration,
    /// How far back the first scan reaches when no key was persisted.
    pub initial_lookback: Duration,
    /// File the scanner persists its `from_key` in.
    pub last_key_path: PathBuf,
}

/// Periodic scanner feeding the job store from the object-storage index.
pub struct IndexScanner {
    client: Arc<ObjStoreClient>,
    store: Arc<Store<JobRun>>,
    config: IndexScannerConfig,
}

impl std::fmt::Debug for IndexScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexScanner")
            .field("config", &self.config)
            .finish()
    }
}

impl IndexScanner {
    pub fn new(
        client: Arc<ObjStoreClient>,
        store: Arc<Store<JobRun>>,
        config: IndexScannerConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    async fn load_last_key(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.config.last_key_path).await {
            Ok(key) => {
                let key = key.trim().to_string();
                (!key.is_empty()).then_some(key)
            }
            Err(_) => None,
        }
    }

    async fn persist_last_key(&self, key: &str) {
        if let Some(parent) = self.config.last_key_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&self.config.last_key_path, key).await {
            warn!("failed to persist index key: {err}");
        }
    }

    /// One scan pass: list every index object after `from_key`, merge the
    /// parsed runs into the store, and return the new key.
    pub async fn scan(&self, from_key: Option<&str>) -> Result<(usize, Option<String>)> {
        let index_prefix = &self.client.config.index_prefix;
        let now = Utc::now();
        let from_time = match from_key {
            Some(key) => key
                .strip_prefix(&format!("{index_prefix}/"))
                .and_then(|base| {
                    (base.len() >= 20)
                        .then(|| DateTime::parse_from_rfc3339(&base[..20]).ok())
                        .flatten()
                })
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now - self.config.initial_lookback),
            None => now - self.config.initial_lookback,
        };

        let mut merged = 0;
        let mut new_key = from_key.map(str::to_string);
        for bucket in scan_prefixes(from_time, now) {
            let prefix = format!("{index_prefix}/{bucket}");
            let mut page_token: Option<String> = None;
            loop {
                let page = with_retries(LIST_RETRIES, RETRY_BASE_DELAY, || {
                    self.client
                        .list_objects(&prefix, from_key, page_token.as_deref())
                })
                .await?;
                for object in &page.items {
                    if from_key.is_some_and(|key| object.name.as_str() <= key) {
                        continue;
                    }
                    match parse_index_object(object) {
                        Ok(run) => {
                            if merge_job_run(&self.store, run) {
                                merged += 1;
                            }
                        }
                        Err(err) => warn!("skipping index object {}: {err}", object.name),
                    }
                    if new_key.as_deref().is_none_or(|key| object.name.as_str() > key) {
                        new_key = Some(object.name.clone());
                    }
                }
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
        }
        Ok((merged, new_key))
    }

    /// Scan on a fixed interval until cancelled, persisting the key after
    /// every successful pass.
    pub async fn run(self, cancel: CancellationToken) {
        let mut last_key = self.load_last_key().await;
        if let Some(key) = &last_key {
            info!("resuming index scan from {key}");
        }
        loop {
            match self.scan(last_key.as_deref()).await {
                Ok((merged, new_key)) => {
                    if merged > 0 {
                        debug!("index scan merged {merged} runs");
                    }
                    if new_key != last_key {
                        if let Some(key) = &new_key {
                            self.persist_last_key(key).await;
                        }
                        last_key = new_key;
                    }
                }
                Err(err) => warn!("index scan failed: {err}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_scan_prefixes_ten_minute() {
        let prefixes = scan_prefixes(ts("2026-08-01T12:34:56Z"), ts("2026-08-01T12:57:00Z"));
        assert_eq!(
            prefixes,
            vec!["2026-08-01T12:3", "2026-08-01T12:4", "2026-08-01T12:5"]
        );
    }

    #[test]
    fn test_scan_prefixes_hourly() {
        let prefixes = scan_prefixes(ts("2026-08-01T03:10:00Z"), ts("2026-08-01T09:00:00Z"));
        assert_eq!(prefixes.len(), 7);
        assert_eq!(prefixes[0], "2026-08-01T03");
        assert_eq!(prefixes[6], "2026-08-01T09");
    }

    #[test]
    fn test_scan_prefixes_daily() {
        let prefixes = scan_prefixes(ts("2026-07-29T10:00:00Z"), ts("2026-08-01T09:00:00Z"));
        assert_eq!(
            prefixes,
            vec!["2026-07-29", "2026-07-30", "2026-07-31", "2026-08-01"]
        );
    }

    #[test]
    fn test_scan_prefixes_inverted_range() {
        assert!(scan_prefixes(ts("2026-08-01T10:00:00Z"), ts("2026-08-01T09:00:00Z")).is_empty());
    }

    #[test]
    fn test_parse_index_object() {
        let object = RawObject {
            name: "index/job-state/2026-08-01T10:20:30Z-a1b2c3".to_string(),
            metadata: HashMap::from([
                (
                    "link".to_string(),
                    "gs://ci-artifacts/logs/periodic-e2e-aws/1234567890".to_string(),
                ),
                ("state".to_string(), "failure".to_string()),
                ("completed".to_string(), "2026-08-01T10:20:29Z".to_string()),
            ]),
            size: Some("0".to_string()),
        };
        let run = parse_index_object(&object).unwrap();
        assert_eq!(run.job_name, "periodic-e2e-aws");
        assert_eq!(run.build_id, "1234567890");
        assert_eq!(run.state, JobState::Failure);
        assert_eq!(run.trigger, Trigger::Build);
        assert_eq!(run.completion_time, Some(ts("2026-08-01T10:20:29Z")));
        assert_eq!(run.artifact_prefix, "logs/periodic-e2e-aws/1234567890");
    }

    #[test]
    fn test_parse_index_object_pull_link() {
        let object = RawObject {
            name: "index/job-state/2026-08-01T10:20:30Z-zz".to_string(),
            metadata: HashMap::from([(
                "link".to_string(),
                "gs://ci-artifacts/pr-logs/pull/org_repo/55/pull-unit/777".to_string(),
            )]),
            size: None,
        };
        let run = parse_index_object(&object).unwrap();
        assert_eq!(run.job_name, "pull-unit");
        assert_eq!(run.build_id, "777");
        assert_eq!(run.trigger, Trigger::Pull);
        // Completion falls back to the object-name timestamp.
        assert_eq!(run.completion_time, Some(ts("2026-08-01T10:20:30Z")));
    }

    #[test]
    fn test_parse_index_object_rejects_garbage() {
        let object = RawObject {
            name: "index/job-state/short".to_string(),
            metadata: HashMap::new(),
            size: None,
        };
        assert!(parse_index_object(&object).is_err());

        let object = RawObject {
            name: "index/job-state/2026-08-01T10:20:30Z-ok".to_string(),
            metadata: HashMap::from([(
                "link".to_string(),
                "gs://bucket/logs/job/not-numeric".to_string(),
            )]),
            size: None,
        };
        assert!(parse_index_object(&object).is_err());
    }

    #[test]
    fn test_urlencode_object_name() {
        assert_eq!(
            urlencode("logs/job name/1/build-log.txt"),
            "logs%2Fjob%20name%2F1%2Fbuild-log.txt"
        );
    }
}
