use chrono::{DateTime, Local};
use scanner_protocol::{Issue, IssueStatus};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Renders the Markdown report and rewrites it atomically after every
/// check's ingest. The on-disk file always equals the canonical
/// rendering of the in-memory issue store between check completions.
pub struct ReportWriter {
    path: PathBuf,
    backup_path: PathBuf,
    target_label: String,
    started_at: DateTime<Local>,
}

impl ReportWriter {
    pub fn new(report_path: &Path, backup_path: &Path, target_directory: &Path) -> Self {
        Self {
            path: report_path.to_path_buf(),
            backup_path: backup_path.to_path_buf(),
            target_label: target_directory.display().to_string(),
            started_at: Local::now(),
        }
    }

    /// Startup rotation: append any existing report to the `.bak` file
    /// under a timestamped header, then remove it. The fresh report
    /// created right after tells the user the daemon is alive.
    pub fn rotate_existing(&self) -> std::io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let mut backup = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.backup_path)?;
        let line = "=".repeat(60);
        writeln!(
            backup,
            "\n\n{line}\nBackup created: {}\n{line}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        )?;
        backup.write_all(content.as_bytes())?;
        backup.flush()?;

        std::fs::remove_file(&self.path)?;
        log::info!("Backed up existing report to {}", self.backup_path.display());
        Ok(())
    }

    /// Render the full document and swap it in via temp-file + rename.
    pub fn write(
        &self,
        issues_by_file: &BTreeMap<String, Vec<Issue>>,
        status_line: &str,
    ) -> std::io::Result<()> {
        let rendered = self.render(issues_by_file, status_line);

        let tmp = self.path.with_extension("md.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn render(&self, issues_by_file: &BTreeMap<String, Vec<Issue>>, status_line: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Code Scanner Report — {}\n\nRun started: {}\n\n",
            self.target_label,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
        ));
        if !status_line.is_empty() {
            out.push_str(&format!("_{status_line}_\n\n"));
        }

        let open: usize = issues_by_file
            .values()
            .flatten()
            .filter(|i| i.status == IssueStatus::Open)
            .count();
        let total: usize = issues_by_file.values().map(Vec::len).sum();
        out.push_str(&format!(
            "**{open} open / {} resolved / {total} total**\n\n",
            total - open
        ));

        if total == 0 {
            out.push_str("No issues found.\n");
            return out;
        }

        for (file, issues) in issues_by_file {
            out.push_str(&format!("## {file}\n\n"));
            for issue in issues {
                out.push_str(&format!(
                    "### [{}] line {} — {}\n\n",
                    issue.status,
                    issue.line_number,
                    issue.first_seen.format("%Y-%m-%d %H:%M:%S"),
                ));
                out.push_str(&format!("*{}*\n\n", issue.check_prompt));
                out.push_str(&format!("{}\n\n", issue.description));
                out.push_str(&render_fix(&issue.suggested_fix));
            }
        }
        out
    }
}

/// The suggested fix as a fenced block. Fixes that already carry their
/// own fences are emitted verbatim.
fn render_fix(fix: &str) -> String {
    if fix.trim().is_empty() {
        return String::new();
    }
    if fix.contains("```") {
        format!("{}\n\n", fix.trim_end())
    } else {
        format!("```\n{fix}\n```\n\n")
    }
}
