//! Bug file serialization: the corpus contract.
//!
//! A line-delimited header, a `---` separator, then comments. Each
//! comment is a header line followed by raw body bytes terminated with
//! the US byte (`0x1E`). Header values are line-sanitized; NUL and `0x1E`
//! inside comment bodies become single spaces on write — lossy by design,
//! the files must stay grep-able line by line.

use chrono::{DateTime, SecondsFormat, Utc};
use forage_model::{Bug, Comment};

use crate::error::{Result, SearchError};

/// Comment terminator byte (ASCII unit separator).
pub const COMMENT_SEPARATOR: u8 = 0x1E;
/// Header/comment boundary line.
const HEADER_END: &str = "---";
/// Staging files sort after their final names and are skipped by readers.
const STAGING_PREFIX: &str = "z-";

/// The two tracker serialization dialects. Structure is identical; field
/// labels, the severity/priority line, and timestamp formats differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Bug,
    Issue,
}

impl Dialect {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Dialect::Bug => "bug-",
            Dialect::Issue => "issue__",
        }
    }

    pub fn staging_prefix(&self) -> &'static str {
        match self {
            Dialect::Bug => "z-bug-",
            Dialect::Issue => "z-issue__",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Dialect::Bug => "Bug",
            Dialect::Issue => "Issue",
        }
    }

    fn severity_label(&self) -> &'static str {
        match self {
            Dialect::Bug => "Severity",
            Dialect::Issue => "Priority",
        }
    }

    fn keywords_label(&self) -> &'static str {
        match self {
            Dialect::Bug => "Keywords",
            Dialect::Issue => "Labels",
        }
    }

    fn target_label(&self) -> &'static str {
        match self {
            Dialect::Bug => "Target Release",
            Dialect::Issue => "Target Version",
        }
    }

    fn environment_label(&self) -> &'static str {
        match self {
            Dialect::Bug => "Environment",
            Dialect::Issue => "Description",
        }
    }

    fn format_time(&self, at: DateTime<Utc>) -> String {
        match self {
            Dialect::Bug => at.to_rfc3339_opts(SecondsFormat::Secs, true),
            Dialect::Issue => at.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string(),
        }
    }

    fn parse_time(&self, raw: &str) -> Result<DateTime<Utc>> {
        let parsed = match self {
            Dialect::Bug => DateTime::parse_from_rfc3339(raw),
            Dialect::Issue => DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f%z"),
        };
        parsed
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| SearchError::Malformed(format!("comment timestamp {raw:?}: {err}")))
    }
}

/// Map a corpus file name to its dialect and entity id; staging files and
/// foreign names yield `None`.
pub fn parse_file_name(name: &str) -> Option<(Dialect, u32)> {
    for dialect in [Dialect::Bug, Dialect::Issue] {
        if let Some(id) = name.strip_prefix(dialect.file_prefix()) {
            return id.parse().ok().map(|id| (dialect, id));
        }
    }
    None
}

pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// Collapse a value onto one line: newlines become single spaces, outer
/// whitespace is trimmed.
fn sanitize_line(value: &str) -> String {
    value
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string()
}

/// Comment bodies keep their newlines but must not contain the record
/// separator or NUL.
fn sanitize_body(body: &str) -> String {
    body.replace([char::from(COMMENT_SEPARATOR), '\0'], " ")
}

pub fn serialize_bug(bug: &Bug, dialect: Dialect) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {}: {}\n",
        dialect.label(),
        bug.id,
        sanitize_line(&bug.summary)
    ));
    let status = format!(
        "{} {}",
        sanitize_line(&bug.status),
        sanitize_line(&bug.resolution)
    );
    out.push_str(&format!("Status: {}\n", status.trim_end()));
    let severity = match dialect {
        Dialect::Bug => &bug.severity,
        Dialect::Issue => &bug.priority,
    };
    out.push_str(&format!(
        "{}: {}\n",
        dialect.severity_label(),
        sanitize_line(severity)
    ));
    out.push_str(&format!("Creator: {}\n", sanitize_line(&bug.creator)));
    out.push_str(&format!("Assigned To: {}\n", sanitize_line(&bug.assignee)));
    out.push_str(&format!(
        "{}: {}\n",
        dialect.keywords_label(),
        join_values(&bug.keywords)
    ));
    out.push_str(&format!("Whiteboard: {}\n", sanitize_line(&bug.whiteboard)));
    out.push_str(&format!(
        "Internal Whiteboard: {}\n",
        sanitize_line(&bug.internal_whiteboard)
    ));
    out.push_str(&format!(
        "{}: {}\n",
        dialect.target_label(),
        join_values(&bug.target_release)
    ));
    out.push_str(&format!("Component: {}\n", join_values(&bug.component)));
    out.push_str(&format!(
        "{}: {}\n",
        dialect.environment_label(),
        sanitize_line(&bug.environment)
    ));
    out.push_str(HEADER_END);
    out.push('\n');

    let mut bytes = out.into_bytes();
    for comment in &bug.comments {
        let header = format!(
            "Comment {} by {} at {}\n",
            comment.id,
            sanitize_line(&comment.author),
            dialect.format_time(comment.created_at)
        );
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(sanitize_body(&comment.body).as_bytes());
        bytes.push(b'\n');
        bytes.push(COMMENT_SEPARATOR);
        bytes.push(b'\n');
    }
    bytes
}

fn join_values(values: &[String]) -> String {
    values
        .iter()
        .map(|v| sanitize_line(v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_values(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(", ").map(str::to_string).collect()
}

/// Two-phase parse: header lines until `---`, then alternating comment
/// header / body-up-to-separator. The caller owns deleting malformed
/// files; timestamps the file does not carry (`refresh_time`,
/// `last_changed_at`) are left at the epoch for the caller to restore
/// from file metadata.
pub fn parse_bug(data: &[u8], dialect: Dialect) -> Result<Bug> {
    let mut cursor = Parser { data, pos: 0 };

    let first = cursor
        .read_line()?
        .ok_or_else(|| SearchError::Malformed("empty bug file".to_string()))?;
    let (id, summary) = parse_first_line(&first, dialect)?;

    let mut bug = Bug {
        id,
        summary,
        status: String::new(),
        resolution: String::new(),
        severity: String::new(),
        priority: String::new(),
        creator: String::new(),
        assignee: String::new(),
        keywords: Vec::new(),
        whiteboard: String::new(),
        internal_whiteboard: String::new(),
        target_release: Vec::new(),
        component: Vec::new(),
        environment: String::new(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        last_changed_at: DateTime::<Utc>::UNIX_EPOCH,
        comments: Vec::new(),
        refresh_time: DateTime::<Utc>::UNIX_EPOCH,
    };

    // Phase 0: header fields.
    loop {
        let line = cursor
            .read_line()?
            .ok_or_else(|| SearchError::Malformed("bug file missing header end".to_string()))?;
        if line == HEADER_END {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(SearchError::Malformed(format!(
                "bug header line without separator: {line:?}"
            )));
        };
        // Empty values serialize as "Key: " or bare "Key:"; both parse to
        // the empty string, never a skip.
        let value = value.strip_prefix(' ').unwrap_or(value);
        apply_header_field(&mut bug, dialect, key, value);
    }

    // Phase 1: comments.
    while !cursor.at_end() {
        let Some(header) = cursor.read_line()? else {
            break;
        };
        if header.is_empty() && cursor.at_end() {
            break;
        }
        let (id, author, created_at) = parse_comment_header(&header, dialect)?;
        let body = cursor.read_body()?;
        bug.comments.push(Comment {
            id,
            author,
            created_at,
            body,
            private: false,
        });
    }

    if let Some(first) = bug.comments.first() {
        bug.created_at = first.created_at;
    }
    if let Some(last) = bug.comments.iter().map(|c| c.created_at).max() {
        bug.last_changed_at = last;
    }
    Ok(bug)
}

fn parse_first_line(line: &str, dialect: Dialect) -> Result<(u32, String)> {
    let rest = line.strip_prefix(dialect.label()).and_then(|r| r.strip_prefix(' '));
    let Some(rest) = rest else {
        return Err(SearchError::Malformed(format!(
            "bug file first line {line:?} does not start with {:?}",
            dialect.label()
        )));
    };
    let Some((id, summary)) = rest.split_once(':') else {
        return Err(SearchError::Malformed(format!(
            "bug file first line {line:?} missing id separator"
        )));
    };
    let id = id
        .parse::<u32>()
        .map_err(|_| SearchError::Malformed(format!("bug id {id:?} is not numeric")))?;
    Ok((id, summary.strip_prefix(' ').unwrap_or(summary).to_string()))
}

fn apply_header_field(bug: &mut Bug, dialect: Dialect, key: &str, value: &str) {
    if key == "Status" {
        match value.split_once(' ') {
            Some((status, resolution)) => {
                bug.status = status.to_string();
                bug.resolution = resolution.to_string();
            }
            None => bug.status = value.to_string(),
        }
    } else if key == dialect.severity_label() {
        match dialect {
            Dialect::Bug => bug.severity = value.to_string(),
            Dialect::Issue => bug.priority = value.to_string(),
        }
    } else if key == "Creator" {
        bug.creator = value.to_string();
    } else if key == "Assigned To" {
        bug.assignee = value.to_string();
    } else if key == dialect.keywords_label() {
        bug.keywords = split_values(value);
    } else if key == "Whiteboard" {
        bug.whiteboard = value.to_string();
    } else if key == "Internal Whiteboard" {
        bug.internal_whiteboard = value.to_string();
    } else if key == dialect.target_label() {
        bug.target_release = split_values(value);
    } else if key == "Component" {
        bug.component = split_values(value);
    } else if key == dialect.environment_label() {
        bug.environment = value.to_string();
    }
    // Unknown keys are ignored for forward compatibility.
}

fn parse_comment_header(line: &str, dialect: Dialect) -> Result<(u64, String, DateTime<Utc>)> {
    let malformed =
        || SearchError::Malformed(format!("comment header {line:?} is not parseable"));
    let rest = line.strip_prefix("Comment ").ok_or_else(malformed)?;
    let (id, rest) = rest.split_once(' ').ok_or_else(malformed)?;
    let id = id.parse::<u64>().map_err(|_| malformed())?;
    let rest = rest.strip_prefix("by ").ok_or_else(malformed)?;
    // Authors may contain spaces; timestamps never do.
    let (author, stamp) = rest.rsplit_once(" at ").ok_or_else(malformed)?;
    let created_at = dialect.parse_time(stamp)?;
    Ok((id, author.to_string(), created_at))
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Next `\n`-terminated line as UTF-8; `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>> {
        if self.at_end() {
            return Ok(None);
        }
        let rest = &self.data[self.pos..];
        let (line, advance) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|err| SearchError::Malformed(format!("non-utf8 header line: {err}")))
    }

    /// Body bytes up to the comment separator. The single newline added
    /// before the separator on write is stripped back off.
    fn read_body(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == COMMENT_SEPARATOR)
            .ok_or_else(|| SearchError::Malformed("comment body missing terminator".to_string()))?;
        let mut body = &rest[..end];
        if body.last() == Some(&b'\n') {
            body = &body[..body.len() - 1];
        }
        self.pos += end + 1;
        // Skip the newline that follows the separator.
        if self.data.get(self.pos) == Some(&b'\n') {
            self.pos += 1;
        }
        Ok(String::from_utf8_lossy(body).into_owned())
    }
}
