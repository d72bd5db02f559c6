//! Stream parser for the engine's null-delimited output.
//!
//! Match lines arrive as `<path>\0<content>`; `--` lines separate match
//! groups within and between files. The parser accumulates per-file,
//! flushing a [`FileMatches`] whenever the filename changes and at end of
//! stream. Group buffering is capped per file; lines beyond the cap only
//! bump the elided counter.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Result, SearchError};

/// Lines longer than this are truncated; the engine is driven through a
/// buffered reader of the same size.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

/// All retained matches for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatches {
    pub path: String,
    /// Match groups in engine order; one group per `--`-separated run of
    /// lines, or per line when the engine emits no separators.
    pub groups: Vec<Vec<Vec<u8>>>,
    /// Lines dropped beyond the per-file cap.
    pub elided: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseStats {
    pub files: usize,
    pub groups: usize,
    pub lines: usize,
}

struct Accumulator {
    path: String,
    groups: Vec<Vec<Vec<u8>>>,
    open_group: Vec<Vec<u8>>,
    retained_groups: usize,
    elided: usize,
    max_groups: usize,
}

impl Accumulator {
    fn new(path: String, max_groups: usize) -> Self {
        Self {
            path,
            groups: Vec::new(),
            open_group: Vec::new(),
            retained_groups: 0,
            elided: 0,
            max_groups,
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        if self.retained_groups >= self.max_groups {
            self.elided += 1;
            return;
        }
        self.open_group.push(line.to_vec());
    }

    fn break_group(&mut self) {
        if !self.open_group.is_empty() {
            self.groups.push(std::mem::take(&mut self.open_group));
            self.retained_groups += 1;
        }
    }

    fn finish(mut self) -> FileMatches {
        self.break_group();
        FileMatches {
            path: self.path,
            groups: self.groups,
            elided: self.elided,
        }
    }
}

/// Parse the match stream, invoking `on_file` once per matched file. The
/// callback returns `false` to stop consuming (budget exhausted); the
/// caller then kills the child and drains.
pub async fn parse_matches<R, F>(
    mut reader: R,
    max_groups_per_file: usize,
    separate_every_line: bool,
    mut on_file: F,
) -> Result<ParseStats>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(FileMatches) -> bool,
{
    let mut stats = ParseStats::default();
    let mut accumulator: Option<Accumulator> = None;
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.len() > MAX_LINE_BYTES {
            buf.truncate(MAX_LINE_BYTES);
        }

        if buf == b"--" {
            if let Some(acc) = accumulator.as_mut() {
                acc.break_group();
            }
            continue;
        }

        let Some(nul) = buf.iter().position(|b| *b == 0) else {
            // Not a match line; the engine said something unexpected.
            return Err(SearchError::Malformed(format!(
                "engine output line without filename delimiter: {:?}",
                String::from_utf8_lossy(&buf[..buf.len().min(120)])
            )));
        };
        let path = String::from_utf8_lossy(&buf[..nul]).into_owned();
        let content = &buf[nul + 1..];

        let same_file = accumulator.as_ref().is_some_and(|acc| acc.path == path);
        if !same_file {
            if let Some(acc) = accumulator.take() {
                stats.groups += acc.retained_groups + usize::from(!acc.open_group.is_empty());
                if !flush(acc, &mut on_file, &mut stats) {
                    return Ok(stats);
                }
            }
            accumulator = Some(Accumulator::new(path, max_groups_per_file));
        }
        let acc = accumulator.as_mut().expect("accumulator exists");
        acc.push_line(content);
        stats.lines += 1;
        if separate_every_line {
            acc.break_group();
        }
    }

    if let Some(acc) = accumulator.take() {
        stats.groups += acc.retained_groups + usize::from(!acc.open_group.is_empty());
        flush(acc, &mut on_file, &mut stats);
    }
    Ok(stats)
}

fn flush<F: FnMut(FileMatches) -> bool>(
    acc: Accumulator,
    on_file: &mut F,
    stats: &mut ParseStats,
) -> bool {
    stats.files += 1;
    on_file(acc.finish())
}

/// Parse `--files-with-matches --null` output: null-terminated paths.
pub async fn parse_file_list<R, F>(mut reader: R, mut on_path: F) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(String) -> bool,
{
    let mut count = 0;
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = reader.read_until(0, &mut buf).await?;
        if read == 0 {
            break;
        }
        if buf.last() == Some(&0) {
            buf.pop();
        }
        // Some engines newline-separate the null-terminated names.
        let start = buf.iter().position(|b| *b != b'\n').unwrap_or(buf.len());
        if start == buf.len() {
            continue;
        }
        count += 1;
        if !on_path(String::from_utf8_lossy(&buf[start..]).into_owned()) {
            break;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(
        input: &[u8],
        cap: usize,
        per_line: bool,
    ) -> (Vec<FileMatches>, ParseStats) {
        let mut out = Vec::new();
        let stats = parse_matches(input, cap, per_line, |m| {
            out.push(m);
            true
        })
        .await
        .unwrap();
        (out, stats)
    }

    fn line(path: &str, content: &str) -> Vec<u8> {
        let mut l = Vec::new();
        l.extend_from_slice(path.as_bytes());
        l.push(0);
        l.extend_from_slice(content.as_bytes());
        l.push(b'\n');
        l
    }

    fn stream(lines: &[Vec<u8>]) -> Vec<u8> {
        lines.concat()
    }

    #[tokio::test]
    async fn test_groups_split_on_separator_and_file_change() {
        let input = stream(&[
            line("a", "one"),
            line("a", "two"),
            b"--\n".to_vec(),
            line("a", "three"),
            line("b", "other"),
        ]);
        let (files, stats) = collect(&input, 100, false).await;

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "a");
        assert_eq!(
            files[0].groups,
            vec![
                vec![b"one".to_vec(), b"two".to_vec()],
                vec![b"three".to_vec()],
            ]
        );
        assert_eq!(files[1].path, "b");
        assert_eq!(files[1].groups, vec![vec![b"other".to_vec()]]);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.lines, 4);
    }

    #[tokio::test]
    async fn test_per_line_mode_caps_and_elides() {
        // 50 matches, cap 5: exactly 5 groups delivered, 45 elided.
        let lines: Vec<Vec<u8>> = (0..50).map(|i| line("f", &format!("m{i}"))).collect();
        let (files, _) = collect(&stream(&lines), 5, true).await;

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].groups.len(), 5);
        assert_eq!(files[0].elided, 45);
        assert_eq!(files[0].groups[0], vec![b"m0".to_vec()]);
        assert_eq!(files[0].groups[4], vec![b"m4".to_vec()]);
    }

    #[tokio::test]
    async fn test_group_cap_counts_lines_elided() {
        let input = stream(&[
            line("f", "g1a"),
            b"--\n".to_vec(),
            line("f", "g2a"),
            line("f", "g2b"),
            b"--\n".to_vec(),
            line("f", "g3a"),
            line("f", "g3b"),
        ]);
        let (files, _) = collect(&input, 2, false).await;
        assert_eq!(files[0].groups.len(), 2);
        // Both lines of the third group were dropped.
        assert_eq!(files[0].elided, 2);
    }

    #[tokio::test]
    async fn test_separator_between_files() {
        // GNU grep emits `--` between files as well as between groups.
        let input = stream(&[
            line("a", "one"),
            b"--\n".to_vec(),
            line("b", "two"),
        ]);
        let (files, _) = collect(&input, 10, false).await;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].groups, vec![vec![b"one".to_vec()]]);
        assert_eq!(files[1].groups, vec![vec![b"two".to_vec()]]);
    }

    #[tokio::test]
    async fn test_early_stop() {
        let input = stream(&[line("a", "x"), line("b", "y"), line("c", "z")]);
        let mut seen = Vec::new();
        parse_matches(input.as_slice(), 10, false, |m| {
            seen.push(m.path);
            false
        })
        .await
        .unwrap();
        assert_eq!(seen, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_garbage_line_is_malformed() {
        let result = parse_matches(b"no delimiter here\n".as_slice(), 10, false, |_| true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_file_list_parse() {
        let mut input = Vec::new();
        input.extend_from_slice(b"path/one\0");
        input.extend_from_slice(b"path/two\0");
        let mut paths = Vec::new();
        let count = parse_file_list(input.as_slice(), |p| {
            paths.push(p);
            true
        })
        .await
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(paths, vec!["path/one".to_string(), "path/two".to_string()]);
    }
}
