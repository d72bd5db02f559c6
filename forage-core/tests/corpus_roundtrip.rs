//! On-disk round trips through the real filesystem: serialize, publish
//! atomically, read back.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use forage_core::corpus::writer::{read_bug_file, write_bug};
use forage_core::corpus::{Corpus, Dialect};
use forage_model::{Bug, Comment};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn bug_181() -> Bug {
    Bug {
        id: 181,
        summary: "Test bug".into(),
        status: "NEW".into(),
        resolution: String::new(),
        severity: "urgent".into(),
        priority: String::new(),
        creator: "reporter@example.com".into(),
        assignee: "triage@example.com".into(),
        keywords: vec!["flake".into()],
        whiteboard: String::new(),
        internal_whiteboard: String::new(),
        target_release: vec!["4.19.z".into()],
        component: vec!["networking".into(), "dns".into()],
        environment: "gcp".into(),
        created_at: ts(1_700_000_000),
        last_changed_at: ts(1_700_100_000),
        comments: vec![Comment {
            id: 1,
            author: "reporter@example.com".into(),
            created_at: ts(1_700_000_000),
            body: "Text with newlines\n\nNewline\n".into(),
            private: false,
        }],
        refresh_time: ts(1_700_200_000),
    }
}

async fn corpus() -> (TempDir, Arc<Corpus>) {
    let dir = tempfile::tempdir().unwrap();
    let corpus = Arc::new(Corpus::new(dir.path()));
    corpus.ensure_layout().await.unwrap();
    (dir, corpus)
}

#[tokio::test]
async fn bug_round_trip_preserves_comment_bodies() {
    let (_tmp, corpus) = corpus().await;
    let bug = bug_181();

    let path = write_bug(&corpus, &bug, Dialect::Bug).await.unwrap();
    let parsed = read_bug_file(&path, Dialect::Bug).unwrap();

    assert_eq!(parsed.id, 181);
    assert_eq!(parsed.summary, "Test bug");
    assert_eq!(parsed.status, "NEW");
    assert_eq!(parsed.comments.len(), 1);
    assert_eq!(parsed.comments[0].body, "Text with newlines\n\nNewline\n");
    assert_eq!(parsed.comments[0].author, "reporter@example.com");
    assert_eq!(parsed.keywords, vec!["flake".to_string()]);
    assert_eq!(
        parsed.component,
        vec!["networking".to_string(), "dns".to_string()]
    );
    // refresh_time comes back from the file mtime the writer pinned.
    assert_eq!(parsed.refresh_time, bug.refresh_time);
}

#[tokio::test]
async fn separator_byte_replaced_and_dashes_stay_literal() {
    let (_tmp, corpus) = corpus().await;
    let mut bug = bug_181();
    bug.comments[0].body = "Fake\u{1e} comment\n---".into();

    let path = write_bug(&corpus, &bug, Dialect::Bug).await.unwrap();
    let parsed = read_bug_file(&path, Dialect::Bug).unwrap();

    assert_eq!(parsed.comments.len(), 1);
    assert_eq!(parsed.comments[0].body, "Fake  comment\n---");
}

#[tokio::test]
async fn grep_friendly_layout_on_disk() {
    let (_tmp, corpus) = corpus().await;
    write_bug(&corpus, &bug_181(), Dialect::Bug).await.unwrap();

    let raw = std::fs::read(corpus.bug_path(181, Dialect::Bug)).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("Bug 181: Test bug\n"));
    assert!(text.contains("\nStatus: NEW\n"));
    assert!(text.contains("\nSeverity: urgent\n"));
    assert!(text.contains("\nInternal Whiteboard: \n"));
    assert!(text.contains("\n---\n"));
    assert!(text.contains("Comment 1 by reporter@example.com at 2023-11-14T22:13:20Z\n"));
    assert!(raw.contains(&0x1E));
}

#[tokio::test]
async fn crash_safety_staging_never_replaces_final() {
    let (_tmp, corpus) = corpus().await;
    let bug = bug_181();
    write_bug(&corpus, &bug, Dialect::Bug).await.unwrap();

    // A lingering staging file (simulated crash) must not shadow the
    // published record.
    std::fs::write(corpus.bug_staging_path(181, Dialect::Bug), b"torn half-write").unwrap();
    let parsed = read_bug_file(&corpus.bug_path(181, Dialect::Bug), Dialect::Bug).unwrap();
    assert_eq!(parsed.summary, "Test bug");
}
