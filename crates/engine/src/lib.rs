//! The scan engine: drives checks over the changed worktree.
//!
//! The [`Scanner`] consumes ChangeSets from the watcher cell, plans
//! context-window batches, queries the model per check, and feeds
//! results into the [`IssueTracker`]. The watermark re-scan algorithm
//! guarantees that when the scanner goes idle, every check has executed
//! against content equal to the current worktree for every file it
//! scanned.

mod planner;
mod report;
mod scanner;
mod tracker;

pub use planner::{plan_batches, Batch, PlanOutcome};
pub use report::ReportWriter;
pub use scanner::Scanner;
pub use tracker::{IngestOutcome, IssueTracker, DEFAULT_SIMILARITY_THRESHOLD};
