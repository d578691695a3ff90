use crate::error::{ToolError, ToolResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Hard cap on matches gathered per search so a degenerate pattern
/// cannot balloon the tool response; pagination works below this.
const MAX_COLLECTED_MATCHES: usize = 5_000;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SearchMatch {
    pub pattern: String,
    pub file: String,
    pub line: u32,
    pub code: String,
}

/// Verify ripgrep is installed; required for `search_text` and usage
/// lookups.
pub fn verify_ripgrep() -> ToolResult<PathBuf> {
    which::which("rg").map_err(|_| {
        ToolError::MissingBinary(
            "ripgrep (rg) not found.\n\
             The scanner requires ripgrep for repository text search.\n\
             Install it:\n\
             \x20 Ubuntu/Debian: sudo apt install ripgrep\n\
             \x20 macOS:         brew install ripgrep"
                .to_string(),
        )
    })
}

/// Run one ripgrep pass per pattern and attribute matches back to the
/// pattern that produced them.
pub(crate) async fn run_ripgrep(
    root: &Path,
    patterns: &[String],
    is_regex: bool,
    whole_word: bool,
    case_sensitive: bool,
    file_pattern: Option<&str>,
) -> ToolResult<Vec<SearchMatch>> {
    let rg = verify_ripgrep()?;
    let mut matches = Vec::new();

    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }

        let mut cmd = Command::new(&rg);
        cmd.current_dir(root)
            .args(["--line-number", "--no-heading", "--color", "never"]);
        if !is_regex {
            cmd.arg("--fixed-strings");
        }
        if whole_word {
            cmd.arg("--word-regexp");
        }
        if !case_sensitive {
            cmd.arg("--ignore-case");
        }
        if let Some(glob) = file_pattern {
            cmd.args(["--glob", glob]);
        }
        for dir in crate::paths::FILTERED_DIRS {
            cmd.args(["--glob", &format!("!{dir}/**")]);
        }
        cmd.arg("-e").arg(pattern).arg("./");

        let output = cmd
            .output()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to run ripgrep: {e}")))?;

        // Exit code 1 means no matches; anything above is a real error.
        if let Some(code) = output.status.code() {
            if code > 1 {
                return Err(ToolError::Execution(format!(
                    "ripgrep failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim(),
                )));
            }
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(path), Some(line_no), Some(code)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(line_no) = line_no.parse::<u32>() else {
                continue;
            };
            matches.push(SearchMatch {
                pattern: pattern.clone(),
                file: path.trim_start_matches("./").to_string(),
                line: line_no,
                code: code.trim().to_string(),
            });
            if matches.len() >= MAX_COLLECTED_MATCHES {
                log::warn!("Search truncated at {MAX_COLLECTED_MATCHES} matches");
                return Ok(matches);
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/app.rs"),
            "fn handle() {}\nfn main() { handle(); }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "handle with care\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn whole_word_search_finds_matches_across_files() {
        if verify_ripgrep().is_err() {
            eprintln!("skipping: ripgrep not installed");
            return;
        }
        let dir = repo();
        let matches = run_ripgrep(
            dir.path(),
            &["handle".to_string()],
            false,
            true,
            false,
            None,
        )
        .await
        .unwrap();

        assert!(matches.len() >= 3, "{matches:?}");
        assert!(matches.iter().all(|m| m.pattern == "handle"));
        assert!(matches.iter().any(|m| m.file == "notes.txt"));
    }

    #[tokio::test]
    async fn file_pattern_filters_results() {
        if verify_ripgrep().is_err() {
            eprintln!("skipping: ripgrep not installed");
            return;
        }
        let dir = repo();
        let matches = run_ripgrep(
            dir.path(),
            &["handle".to_string()],
            false,
            true,
            false,
            Some("*.rs"),
        )
        .await
        .unwrap();
        assert!(matches.iter().all(|m| m.file.ends_with(".rs")));
    }

    #[tokio::test]
    async fn no_matches_is_not_an_error() {
        if verify_ripgrep().is_err() {
            eprintln!("skipping: ripgrep not installed");
            return;
        }
        let dir = repo();
        let matches = run_ripgrep(
            dir.path(),
            &["definitely_absent_token".to_string()],
            false,
            true,
            false,
            None,
        )
        .await
        .unwrap();
        assert!(matches.is_empty());
    }
}
