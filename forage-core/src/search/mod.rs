//! Search execution over the corpus.
//!
//! Translates a query into bounded external-process invocations: one
//! engine run per pattern over the restricted path set, stdout
//! stream-parsed into per-file match groups, with per-file caps, a hard
//! aggregate byte ceiling, and prompt child teardown on cancellation.

pub mod buffer;
pub mod parse;
pub mod tool;

use std::process::Stdio;
use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use forage_model::SearchQuery;

use crate::error::{Result, SearchError};
use crate::resolve::PathResolver;
use crate::search::parse::{MAX_LINE_BYTES, parse_file_list, parse_matches};
use crate::search::tool::SearchTool;

pub use buffer::SortableWriter;
pub use parse::{FileMatches, ParseStats};
pub use tool::{SearchTool as Tool, ToolKind};

/// Aggregate result of one query execution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub files: usize,
    pub matches: usize,
    pub bytes: usize,
    /// The byte ceiling cut the stream short.
    pub truncated: bool,
}

pub struct SearchExecutor {
    resolver: Arc<PathResolver>,
    tool: SearchTool,
}

impl std::fmt::Debug for SearchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchExecutor")
            .field("tool", &self.tool)
            .finish()
    }
}

impl SearchExecutor {
    pub fn new(resolver: Arc<PathResolver>, tool: SearchTool) -> Self {
        Self { resolver, tool }
    }

    /// Run the query, invoking `callback(name, pattern, lines, elided)`
    /// synchronously for each retained match group. `name` is the
    /// corpus-relative path.
    pub async fn execute<F>(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<SearchOutcome>
    where
        F: FnMut(&str, &str, &[Vec<u8>], usize),
    {
        query.validate()?;
        for pattern in &query.patterns {
            Regex::new(pattern)
                .map_err(|err| SearchError::Malformed(format!("invalid pattern: {err}")))?;
        }
        let job_filter = compile_filter(query.job_filter.as_deref(), "name")?;
        let exclude_filter = compile_filter(query.exclude_filter.as_deref(), "excludeName")?;

        let paths = self.resolver.restrict(
            query.kind,
            query.max_age,
            job_filter.as_ref(),
            exclude_filter.as_ref(),
        );
        let mut outcome = SearchOutcome::default();
        if paths.is_empty() {
            debug!("search restricted to zero paths");
            return Ok(outcome);
        }

        for pattern in &query.patterns {
            if outcome.truncated {
                break;
            }
            self.run_pattern(query, pattern, &paths, cancel, &mut outcome, &mut callback)
                .await?;
        }
        Ok(outcome)
    }

    async fn run_pattern<F>(
        &self,
        query: &SearchQuery,
        pattern: &str,
        paths: &[std::path::PathBuf],
        cancel: &CancellationToken,
        outcome: &mut SearchOutcome,
        callback: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&str, &str, &[Vec<u8>], usize),
    {
        let args = if query.context_lines < 0 {
            self.tool.list_args(pattern, paths)
        } else {
            self.tool
                .match_args(pattern, query.context_lines as u32, paths)
        };

        let mut child = Command::new(&self.tool.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let stderr_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            let _ = (&mut stderr).take(8192).read_to_end(&mut tail).await;
            String::from_utf8_lossy(&tail).into_owned()
        });

        let reader = BufReader::with_capacity(MAX_LINE_BYTES, stdout);
        let root = self.resolver.corpus_root().to_path_buf();
        let budget = query.max_bytes;
        let start_bytes = outcome.bytes;

        // Per-pattern accumulators, folded into the outcome afterwards.
        let mut run = PatternRun::default();

        let parse_result = if query.context_lines < 0 {
            let parse = parse_file_list(reader, |path| {
                let name = relativize(&root, &path);
                run.files += 1;
                deliver(
                    &mut run,
                    start_bytes,
                    budget,
                    &name,
                    pattern,
                    &[],
                    0,
                    &mut *callback,
                )
            });
            tokio::select! {
                result = parse => result.map(|_| ()),
                _ = cancel.cancelled() => Err(SearchError::Cancelled("search".to_string())),
            }
        } else {
            // Context 0 emits no group separators; every line is its own
            // match.
            let per_line = query.context_lines == 0;
            let parse = parse_matches(reader, query.max_matches_per_file, per_line, |file| {
                let name = relativize(&root, &file.path);
                run.files += 1;
                for group in &file.groups {
                    let keep = deliver(
                        &mut run,
                        start_bytes,
                        budget,
                        &name,
                        pattern,
                        group,
                        file.elided,
                        &mut *callback,
                    );
                    if !keep {
                        return false;
                    }
                }
                true
            });
            tokio::select! {
                result = parse => result.map(|_| ()),
                _ = cancel.cancelled() => Err(SearchError::Cancelled("search".to_string())),
            }
        };

        let pattern_matches = run.matches;
        outcome.files += run.files;
        outcome.matches += run.matches;
        outcome.bytes += run.bytes;
        outcome.truncated |= run.truncated;

        match &parse_result {
            Ok(()) => {}
            Err(SearchError::Cancelled(_)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return parse_result;
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }

        if outcome.truncated {
            // Budget exhausted: stop the child and drain quietly.
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Ok(());
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        parse_result?;

        if status.success() {
            return Ok(());
        }
        // Exit 1 with nothing dispatched is the engine's way of saying
        // "no matches"; it is not an error.
        if status.code() == Some(1) && pattern_matches == 0 {
            return Ok(());
        }
        if outcome.matches > 0 {
            warn!(
                "search engine exited {status} after partial results: {}",
                stderr_tail.trim()
            );
            return Ok(());
        }
        Err(SearchError::Internal(format!(
            "search engine exited {status}: {}",
            stderr_tail.trim()
        )))
    }
}

/// Per-pattern accumulators, folded into the outcome after the child
/// terminates.
#[derive(Debug, Default)]
struct PatternRun {
    files: usize,
    matches: usize,
    bytes: usize,
    truncated: bool,
}

/// Deliver one match group to the caller unless it would blow the byte
/// ceiling. Returns whether parsing should continue.
#[allow(clippy::too_many_arguments)]
fn deliver<F>(
    run: &mut PatternRun,
    start_bytes: usize,
    budget: usize,
    name: &str,
    pattern: &str,
    lines: &[Vec<u8>],
    elided: usize,
    callback: &mut F,
) -> bool
where
    F: FnMut(&str, &str, &[Vec<u8>], usize),
{
    let cost: usize = lines.iter().map(|l| l.len() + 1).sum::<usize>().max(1);
    if start_bytes + run.bytes + cost > budget {
        run.truncated = true;
        return false;
    }
    callback(name, pattern, lines, elided);
    run.bytes += cost;
    run.matches += 1;
    true
}

fn compile_filter(source: Option<&str>, field: &str) -> Result<Option<Regex>> {
    match source {
        None | Some("") => Ok(None),
        Some(source) => Regex::new(source)
            .map(Some)
            .map_err(|err| SearchError::Malformed(format!("invalid {field} regex: {err}"))),
    }
}

/// Engine output carries absolute paths; the contract upward is
/// corpus-relative names.
fn relativize(root: &std::path::Path, path: &str) -> String {
    std::path::Path::new(path)
        .strip_prefix(root)
        .map(|rel| rel.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}
