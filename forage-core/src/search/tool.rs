//! External regex engine selection and argument building.
//!
//! `rg` is preferred; `grep` is the fallback with equivalent flags. Both
//! are driven in null-delimited filename mode, which the stream parser
//! depends on.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Result, SearchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Ripgrep,
    Grep,
}

#[derive(Debug, Clone)]
pub struct SearchTool {
    pub kind: ToolKind,
    pub path: PathBuf,
}

impl SearchTool {
    /// Locate a usable engine on PATH.
    pub fn detect() -> Result<SearchTool> {
        if let Some(path) = find_in_path("rg") {
            return Ok(SearchTool {
                kind: ToolKind::Ripgrep,
                path,
            });
        }
        if let Some(path) = find_in_path("grep") {
            return Ok(SearchTool {
                kind: ToolKind::Grep,
                path,
            });
        }
        Err(SearchError::Internal(
            "no search engine found on PATH (need rg or grep)".to_string(),
        ))
    }

    pub fn from_path(kind: ToolKind, path: impl Into<PathBuf>) -> SearchTool {
        SearchTool {
            kind,
            path: path.into(),
        }
    }

    /// Argument list for a content search with the given context.
    pub fn match_args(&self, pattern: &str, context_lines: u32, paths: &[PathBuf]) -> Vec<OsString> {
        let mut args: Vec<OsString> = match self.kind {
            ToolKind::Ripgrep => vec![
                "--null".into(),
                "--no-heading".into(),
                "--no-line-number".into(),
                // A single path argument would otherwise drop the
                // filename prefix the parser keys on.
                "--with-filename".into(),
                "--color".into(),
                "never".into(),
                format!("--context={context_lines}").into(),
            ],
            ToolKind::Grep => vec![
                "--null".into(),
                "--with-filename".into(),
                "--binary-files=without-match".into(),
                "--no-messages".into(),
                "-E".into(),
                format!("--context={context_lines}").into(),
            ],
        };
        args.push("-e".into());
        args.push(pattern.into());
        args.push("--".into());
        args.extend(paths.iter().map(|p| p.as_os_str().to_owned().into()));
        args
    }

    /// Argument list for whole-path-only reporting (`context = -1`):
    /// matching file names, null-terminated.
    pub fn list_args(&self, pattern: &str, paths: &[PathBuf]) -> Vec<OsString> {
        let mut args: Vec<OsString> = match self.kind {
            ToolKind::Ripgrep => vec![
                "--files-with-matches".into(),
                "--null".into(),
                "--color".into(),
                "never".into(),
            ],
            ToolKind::Grep => vec![
                "--files-with-matches".into(),
                "--null".into(),
                "--binary-files=without-match".into(),
                "--no-messages".into(),
                "-E".into(),
            ],
        };
        args.push("-e".into());
        args.push(pattern.into());
        args.push("--".into());
        args.extend(paths.iter().map(|p| p.as_os_str().to_owned().into()));
        args
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ripgrep_match_args() {
        let tool = SearchTool::from_path(ToolKind::Ripgrep, "/usr/bin/rg");
        let paths = vec![PathBuf::from("/corpus/bugs/bug-1")];
        let args = tool.match_args("panic:", 2, &paths);
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(rendered.contains(&"--null".to_string()));
        assert!(rendered.contains(&"--context=2".to_string()));
        // The pattern rides behind -e so a leading dash cannot become a flag.
        let e_at = rendered.iter().position(|a| a == "-e").unwrap();
        assert_eq!(rendered[e_at + 1], "panic:");
        assert_eq!(rendered.last().unwrap(), "/corpus/bugs/bug-1");
    }

    #[test]
    fn test_grep_fallback_args() {
        let tool = SearchTool::from_path(ToolKind::Grep, "/bin/grep");
        let args = tool.match_args("error", 0, &[PathBuf::from("/f")]);
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(rendered.contains(&"--null".to_string()));
        assert!(rendered.contains(&"-E".to_string()));
        assert!(rendered.contains(&"--context=0".to_string()));
    }

    #[test]
    fn test_list_args() {
        let tool = SearchTool::from_path(ToolKind::Ripgrep, "/usr/bin/rg");
        let args = tool.list_args("x", &[PathBuf::from("/f")]);
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(rendered.contains(&"--files-with-matches".to_string()));
        assert!(rendered.contains(&"--null".to_string()));
    }

    #[test]
    fn test_detect_finds_something() {
        // Any sane CI machine has grep.
        let tool = SearchTool::detect().unwrap();
        assert!(tool.path.is_absolute() || tool.path.exists());
    }
}
