//! Git change detection for the scanner.
//!
//! The watcher polls `git status` on its own task, assembles a
//! [`ChangeSet`](scanner_protocol::ChangeSet) of uncommitted paths, and
//! publishes it into a single-slot latest-wins cell the scanner reads
//! at well-defined points. A unified [`FileFilter`] is the one source
//! of exclusion truth for both sides.

mod cell;
mod error;
mod filter;
mod watcher;

pub use cell::{ChangeSetCell, WatcherState};
pub use error::{GitError, Result};
pub use filter::FileFilter;
pub use watcher::GitWatcher;
