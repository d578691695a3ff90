use crate::text::normalize_whitespace;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Status of a detected issue. Resolution is terminal within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueStatus {
    Open,
    Resolved,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueStatus::Open => write!(f, "OPEN"),
            IssueStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// A single finding reported by the model and tracked across scans.
///
/// Identity is approximate: issues are matched by file plus fuzzy
/// similarity over normalized snippets (or descriptions when no snippet
/// is available), never by line number, since code moves between scans.
#[derive(Debug, Clone)]
pub struct Issue {
    pub file_path: String,
    pub line_number: u32,
    pub description: String,
    pub suggested_fix: String,
    pub check_prompt: String,
    pub first_seen: DateTime<Local>,
    pub status: IssueStatus,
    pub code_snippet: String,
}

impl Issue {
    /// Snippet normalized for identity comparison. Falls back to the
    /// description when the model supplied no snippet.
    pub fn identity_text(&self) -> String {
        if self.code_snippet.trim().is_empty() {
            normalize_whitespace(&self.description)
        } else {
            normalize_whitespace(&self.code_snippet)
        }
    }

    pub fn has_snippet(&self) -> bool {
        !self.code_snippet.trim().is_empty()
    }
}

/// One issue as the model reports it on the wire.
///
/// The canonical keys are `file`, `line_number`, `description` and
/// `suggested_fix`; the aliases cover common model drift. The snippet
/// is requested by the system prompt but tolerated when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedIssue {
    #[serde(alias = "file_path")]
    pub file: String,
    #[serde(alias = "line")]
    pub line_number: u32,
    pub description: String,
    #[serde(default, alias = "fix")]
    pub suggested_fix: String,
    #[serde(default)]
    pub code_snippet: String,
}

impl ReportedIssue {
    /// Build a tracked issue under the check that produced it.
    pub fn into_issue(self, check_prompt: &str, first_seen: DateTime<Local>) -> Issue {
        Issue {
            file_path: self.file,
            line_number: self.line_number.max(1),
            description: self.description,
            suggested_fix: self.suggested_fix,
            check_prompt: check_prompt.to_string(),
            first_seen,
            status: IssueStatus::Open,
            code_snippet: self.code_snippet,
        }
    }
}

/// The assistant's final message must deserialize to this shape.
/// Empty findings are `{"issues": []}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueReport {
    #[serde(default)]
    pub issues: Vec<ReportedIssue>,
}
