use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder author recorded when private comments are redacted.
pub const REDACTED_AUTHOR: &str = "<redacted>";

/// A tracker issue as the index understands it.
///
/// Field values mirror what the remote tracker reports; all of them are
/// free text from the index's point of view. `refresh_time` is the wall
/// clock of the last successful reconcile against the remote source and
/// doubles as the on-disk modification time of the serialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    pub id: u32,
    pub summary: String,
    pub status: String,
    pub resolution: String,
    pub severity: String,
    pub priority: String,
    pub creator: String,
    pub assignee: String,
    pub keywords: Vec<String>,
    pub whiteboard: String,
    pub internal_whiteboard: String,
    pub target_release: Vec<String>,
    pub component: Vec<String>,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
    pub comments: Vec<Comment>,
    pub refresh_time: DateTime<Utc>,
}

impl Bug {
    /// A bug with only identity and header fields, no comments yet.
    pub fn without_comments(&self) -> Bug {
        let mut bug = self.clone();
        bug.comments.clear();
        bug
    }

    pub fn is_closed(&self) -> bool {
        self.status.eq_ignore_ascii_case("closed")
    }

    /// The newest activity timestamp: the latest comment, or the header
    /// change time when it is newer (status flips do not add comments).
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.comments
            .iter()
            .map(|c| c.created_at)
            .max()
            .map_or(self.last_changed_at, |t| t.max(self.last_changed_at))
    }

    /// Replace the comment list, keeping comments ordered by id.
    pub fn set_comments(&mut self, mut comments: Vec<Comment>) {
        comments.sort_by_key(|c| c.id);
        self.comments = comments;
    }
}

/// A single tracker comment. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub created_at: DateTime<Utc>,
    /// Raw body bytes as UTF-8; may contain newlines. NUL and the record
    /// separator byte are replaced with spaces when written to disk.
    pub body: String,
    pub private: bool,
}

impl Comment {
    /// Collapse a private comment into the redaction placeholder.
    pub fn redacted(id: u64, created_at: DateTime<Utc>) -> Comment {
        Comment {
            id,
            author: REDACTED_AUTHOR.to_string(),
            created_at,
            body: String::new(),
            private: true,
        }
    }
}
