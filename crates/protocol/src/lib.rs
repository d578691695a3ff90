//! # Scanner Protocol
//!
//! Shared data model for the code scanner.
//!
//! ## Pipeline
//!
//! ```text
//! Git worktree
//!     │
//!     ├──> Git Watcher (ChangeSet)
//!     │      └─> Scanner Engine
//!     │
//!     ├──> Check schedule (CheckGroup × prompt)
//!     │      └─> LLM client (IssueReport)
//!     │
//!     └──> Issue Tracker (Issue)
//!            └─> Markdown report
//! ```
//!
//! This crate holds the types every other crate speaks: issues, check
//! groups, change sets, file snapshots, the wire contract for model
//! responses, and the strictly validated TOML configuration.

mod changes;
mod config;
mod error;
mod issue;
pub mod text;

pub use changes::{ChangeDelta, ChangeSet, ChangedFile, FileChangeKind, FileSnapshot};
pub use config::{
    load_config, BackendKind, CheckGroup, Config, LlmSettings, LOCK_FILE_NAME, LOG_FILE_NAME,
    REPORT_BACKUP_NAME, REPORT_FILE_NAME,
};
pub use error::{ConfigError, Result};
pub use issue::{Issue, IssueReport, IssueStatus, ReportedIssue};
