//! Atomic corpus publication.
//!
//! Every file lands via staging write, flush, fsync, mtime fix-up, then
//! rename onto the final name — a crash leaves either the old complete
//! file or the new complete file, never a torn one. Any error on the way
//! deletes the staging file.

use std::fs::{self, File, FileTimes};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use forage_model::Bug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::corpus::bugfile::{Dialect, serialize_bug};
use crate::corpus::Corpus;
use crate::error::{Result, SearchError};
use crate::store::Store;

/// Blocking atomic write; callers wrap in `spawn_blocking`.
pub(crate) fn write_file_atomic(
    staging: &Path,
    target: &Path,
    data: &[u8],
    mtime: SystemTime,
) -> std::io::Result<()> {
    let outcome = (|| {
        let mut file = File::create(staging)?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;
        file.set_times(FileTimes::new().set_modified(mtime))?;
        drop(file);
        fs::rename(staging, target)
    })();
    if outcome.is_err() {
        let _ = fs::remove_file(staging);
    }
    outcome
}

/// Serialize and publish one bug record.
pub async fn write_bug(corpus: &Corpus, bug: &Bug, dialect: Dialect) -> Result<PathBuf> {
    let staging = corpus.bug_staging_path(bug.id, dialect);
    let target = corpus.bug_path(bug.id, dialect);
    let data = serialize_bug(bug, dialect);
    let mtime = SystemTime::from(bug.refresh_time);

    let result_path = target.clone();
    tokio::task::spawn_blocking(move || write_file_atomic(&staging, &target, &data, mtime))
        .await
        .map_err(|err| SearchError::Internal(format!("corpus write task: {err}")))??;
    Ok(result_path)
}

/// A publication request for the bug tree.
#[derive(Debug)]
pub enum PublishOp {
    /// Rewrite the current in-store record for this id.
    Refresh(u32),
    /// The entity disappeared from the authoritative listing: write one
    /// final record with status closed, then let TTL age it out.
    Closed(Arc<Bug>),
}

/// Consumes publish requests and owns all writes under `bugs/`.
pub struct BugPublisher {
    corpus: Arc<Corpus>,
    store: Arc<Store<Bug>>,
    dialect: Dialect,
    rx: mpsc::Receiver<PublishOp>,
}

impl std::fmt::Debug for BugPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BugPublisher")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl BugPublisher {
    pub fn new(
        corpus: Arc<Corpus>,
        store: Arc<Store<Bug>>,
        dialect: Dialect,
        rx: mpsc::Receiver<PublishOp>,
    ) -> Self {
        Self {
            corpus,
            store,
            dialect,
            rx,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => return,
                op = self.rx.recv() => match op {
                    Some(op) => op,
                    None => return,
                },
            };
            match op {
                PublishOp::Refresh(id) => {
                    let Some(bug) = self.store.get(&id) else {
                        // Deleted between merge and publish; the Closed op
                        // for it is already in flight.
                        continue;
                    };
                    if let Err(err) = write_bug(&self.corpus, &bug, self.dialect).await {
                        warn!("failed to publish bug {id}: {err}");
                    } else {
                        debug!("published bug {id}");
                    }
                }
                PublishOp::Closed(bug) => {
                    let mut memorial = bug.as_ref().clone();
                    if !memorial.is_closed() {
                        memorial.status = "CLOSED".to_string();
                    }
                    memorial.refresh_time = Utc::now();
                    if let Err(err) = write_bug(&self.corpus, &memorial, self.dialect).await {
                        warn!("failed to publish closed bug {}: {err}", memorial.id);
                    } else {
                        debug!("published closed memorial for bug {}", memorial.id);
                    }
                }
            }
        }
    }
}

/// Read a bug file back, restoring the timestamps the serialization does
/// not carry from file metadata.
pub fn read_bug_file(path: &Path, dialect: Dialect) -> Result<Bug> {
    let data = fs::read(path)?;
    let mut bug = crate::corpus::bugfile::parse_bug(&data, dialect)?;
    if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
        let mtime: DateTime<Utc> = modified.into();
        bug.refresh_time = mtime;
        if mtime > bug.last_changed_at {
            bug.last_changed_at = mtime;
        }
    }
    Ok(bug)
}

/// Startup walk over `bugs/`: parse every live record, delete whatever
/// does not parse, and return the open entities for store insertion.
/// Closed records are on-disk memorials only and are not returned.
pub fn load_bugs(corpus: &Corpus, dialect: Dialect) -> Result<Vec<Bug>> {
    let dir = corpus.bugs_dir();
    let mut bugs = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(bugs),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((file_dialect, id)) = crate::corpus::bugfile::parse_file_name(name) else {
            continue;
        };
        if file_dialect != dialect {
            continue;
        }
        match read_bug_file(&entry.path(), dialect) {
            Ok(bug) if bug.is_closed() => debug!("skipping closed bug {id} at startup"),
            Ok(bug) => bugs.push(bug),
            Err(err) => {
                warn!("deleting malformed corpus file {name}: {err}");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(bugs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forage_model::Comment;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bug(id: u32, status: &str) -> Bug {
        Bug {
            id,
            summary: format!("bug {id}"),
            status: status.into(),
            resolution: String::new(),
            severity: "low".into(),
            priority: String::new(),
            creator: "a@example.com".into(),
            assignee: "b@example.com".into(),
            keywords: vec![],
            whiteboard: String::new(),
            internal_whiteboard: String::new(),
            target_release: vec![],
            component: vec![],
            environment: String::new(),
            created_at: ts(100),
            last_changed_at: ts(200),
            comments: vec![Comment {
                id: 1,
                author: "a@example.com".into(),
                created_at: ts(100),
                body: "first observation\n".into(),
                private: false,
            }],
            refresh_time: ts(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_write_sets_mtime_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.ensure_layout().await.unwrap();

        let bug = bug(181, "NEW");
        let path = write_bug(&corpus, &bug, Dialect::Bug).await.unwrap();
        assert!(path.ends_with("bugs/bug-181"));
        assert!(path.exists());
        assert!(!corpus.bug_staging_path(181, Dialect::Bug).exists());

        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        let modified: DateTime<Utc> = modified.into();
        assert_eq!(modified.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.ensure_layout().await.unwrap();

        let mut record = bug(181, "NEW");
        write_bug(&corpus, &record, Dialect::Bug).await.unwrap();
        record.summary = "updated".into();
        let path = write_bug(&corpus, &record, Dialect::Bug).await.unwrap();

        let reread = read_bug_file(&path, Dialect::Bug).unwrap();
        assert_eq!(reread.summary, "updated");
    }

    #[tokio::test]
    async fn test_load_bugs_skips_closed_and_deletes_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(dir.path());
        corpus.ensure_layout().await.unwrap();

        write_bug(&corpus, &bug(1, "NEW"), Dialect::Bug).await.unwrap();
        write_bug(&corpus, &bug(2, "CLOSED"), Dialect::Bug).await.unwrap();
        fs::write(corpus.bugs_dir().join("bug-3"), b"garbage\n").unwrap();
        fs::write(corpus.bugs_dir().join("README"), b"not an entity\n").unwrap();

        let loaded = load_bugs(&corpus, Dialect::Bug).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 1);
        // refresh_time restored from the file mtime we set on write.
        assert_eq!(loaded[0].refresh_time.timestamp(), 1_700_000_000);

        // The malformed file is gone; the closed memorial and the foreign
        // file are left for the sweeper.
        assert!(!corpus.bugs_dir().join("bug-3").exists());
        assert!(corpus.bugs_dir().join("bug-2").exists());
        assert!(corpus.bugs_dir().join("README").exists());
    }

    #[tokio::test]
    async fn test_publisher_refresh_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Arc::new(Corpus::new(dir.path()));
        corpus.ensure_layout().await.unwrap();
        let store = Arc::new(Store::new());
        store.insert(bug(5, "NEW"));

        let (tx, rx) = mpsc::channel(8);
        let publisher = BugPublisher::new(
            Arc::clone(&corpus),
            Arc::clone(&store),
            Dialect::Bug,
            rx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(publisher.run(cancel.clone()));

        tx.send(PublishOp::Refresh(5)).await.unwrap();
        tx.send(PublishOp::Closed(Arc::new(bug(6, "NEW")))).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let open = read_bug_file(&corpus.bug_path(5, Dialect::Bug), Dialect::Bug).unwrap();
        assert_eq!(open.id, 5);
        let closed = read_bug_file(&corpus.bug_path(6, Dialect::Bug), Dialect::Bug).unwrap();
        assert_eq!(closed.status, "CLOSED");
        drop(cancel);
    }
}
