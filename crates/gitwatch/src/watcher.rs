use crate::cell::{ChangeSetCell, WatcherState};
use crate::error::{GitError, Result};
use crate::filter::FileFilter;
use scanner_protocol::text::sha256_hex;
use scanner_protocol::{ChangeSet, ChangedFile, FileChangeKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time;

/// Polls a Git worktree for uncommitted changes and publishes the
/// resulting [`ChangeSet`] into the shared cell.
///
/// One poll emits at most one publication. While a merge or rebase is
/// in progress the watcher publishes [`WatcherState::Wait`] and never a
/// ChangeSet.
pub struct GitWatcher {
    repo_root: PathBuf,
    git_dir: PathBuf,
    base_commit: Option<String>,
    filter: Arc<FileFilter>,
}

impl GitWatcher {
    /// Validate the repository (and the pinned base commit, if any) and
    /// build a watcher.
    pub async fn connect(
        repo_root: &Path,
        base_commit: Option<String>,
        filter: Arc<FileFilter>,
    ) -> Result<Self> {
        let output = git(repo_root, &["rev-parse", "--git-dir"]).await;
        let git_dir = match output {
            Ok(stdout) => {
                let raw = stdout.trim();
                let dir = PathBuf::from(raw);
                if dir.is_absolute() {
                    dir
                } else {
                    repo_root.join(dir)
                }
            }
            Err(_) => return Err(GitError::NotARepository(repo_root.display().to_string())),
        };

        if let Some(commit) = &base_commit {
            let probe = format!("{commit}^{{commit}}");
            if git(repo_root, &["rev-parse", "--verify", "--quiet", &probe])
                .await
                .is_err()
            {
                return Err(GitError::InvalidCommit(commit.clone()));
            }
            log::info!("Using base commit: {commit}");
        }

        log::info!("Connected to Git repository: {}", repo_root.display());
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            git_dir,
            base_commit,
            filter,
        })
    }

    /// One poll: conflict gate, then ChangeSet assembly.
    pub async fn poll(&self) -> Result<WatcherState> {
        if self.conflict_in_progress() {
            log::info!("Merge/rebase in progress, skipping change detection");
            return Ok(WatcherState::Wait);
        }
        let change_set = self.assemble_changeset().await?;
        Ok(WatcherState::Ready(change_set))
    }

    /// Poll loop. The first publication is unconditional even when the
    /// set is empty so the scanner can enter its idle state.
    pub async fn run(
        self,
        cell: ChangeSetCell,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_published: Option<WatcherState> = None;

        loop {
            match self.poll().await {
                Ok(state) => {
                    let should_publish = match (&last_published, &state) {
                        (None, _) => true,
                        (Some(WatcherState::Wait), WatcherState::Wait) => false,
                        (Some(prev), next) => prev != next,
                    };
                    if should_publish {
                        if let (Some(WatcherState::Ready(prev)), WatcherState::Ready(next)) =
                            (&last_published, &state)
                        {
                            let delta = next.delta_from(prev);
                            if !delta.added.is_empty() {
                                log::info!("New changed files detected: {:?}", delta.added);
                            }
                            if !delta.removed.is_empty() {
                                log::info!("Files no longer changed: {:?}", delta.removed);
                            }
                            if !delta.modified.is_empty() {
                                log::info!("Files modified by content: {:?}", delta.modified);
                            }
                        }
                        cell.publish(state.clone());
                        last_published = Some(state);
                    }
                }
                Err(err) => log::warn!("Git poll failed: {err}"),
            }

            tokio::select! {
                _ = time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Git watcher stopping");
                        return;
                    }
                }
            }
        }
    }

    fn conflict_in_progress(&self) -> bool {
        self.git_dir.join("MERGE_HEAD").exists()
            || self.git_dir.join("REBASE_HEAD").exists()
            || self.git_dir.join("rebase-merge").exists()
            || self.git_dir.join("rebase-apply").exists()
    }

    async fn assemble_changeset(&self) -> Result<ChangeSet> {
        let status = git(
            &self.repo_root,
            &["status", "--porcelain=v2", "--untracked-files=all"],
        )
        .await?;

        let mut entries = parse_porcelain_v2(&status);

        if let Some(commit) = &self.base_commit {
            let diff = git(&self.repo_root, &["diff", "--name-status", commit, "--"]).await?;
            let seen: HashSet<String> = entries.iter().map(|(p, _)| p.clone()).collect();
            for (path, kind) in parse_name_status(&diff) {
                if !seen.contains(&path) {
                    entries.push((path, kind));
                }
            }
        }

        // `git status` already honors gitignore; the batched
        // check-ignore pass only covers base-commit entries when the
        // in-memory engine could not be built.
        if !self.filter.has_gitignore_engine() && self.base_commit.is_some() {
            let candidates: Vec<String> = entries.iter().map(|(p, _)| p.clone()).collect();
            let ignored = batch_check_ignore(&self.repo_root, &candidates).await;
            entries.retain(|(path, _)| !ignored.contains(path));
        }

        let mut files = Vec::new();
        for (path, kind) in entries {
            if let Some(reason) = self.filter.skip_reason(&path) {
                log::debug!("Skipping {path}: {reason}");
                continue;
            }

            let full_path = self.repo_root.join(&path);
            // Submodules show up as directories in status output.
            if full_path.is_dir() {
                continue;
            }

            let (kind, content_hash) = if kind == FileChangeKind::Deleted || !full_path.exists() {
                (FileChangeKind::Deleted, None)
            } else {
                match tokio::fs::read(&full_path).await {
                    Ok(bytes) => (kind, Some(sha256_hex(&bytes))),
                    Err(err) => {
                        log::debug!("Cannot read {path} for hashing: {err}");
                        continue;
                    }
                }
            };

            files.push(ChangedFile {
                path,
                kind,
                content_hash,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        Ok(ChangeSet { files })
    }
}

/// Parse `git status --porcelain=v2 --untracked-files=all` output.
pub(crate) fn parse_porcelain_v2(output: &str) -> Vec<(String, FileChangeKind)> {
    let mut entries: Vec<(String, FileChangeKind)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(' ').collect();

        let (xy, path) = match parts.first().copied() {
            Some("1") if parts.len() > 8 => (parts[1], parts[8..].join(" ")),
            Some("2") if parts.len() > 9 => {
                // Rename: `<path>\t<origPath>`; the target path comes first.
                let tail = parts[9..].join(" ");
                let path = tail.split('\t').next().unwrap_or(&tail).to_string();
                (parts[1], path)
            }
            Some("?") if parts.len() > 1 => ("??", parts[1..].join(" ")),
            Some("u") if parts.len() > 10 => (parts[1], parts[10..].join(" ")),
            _ => continue,
        };

        let path = unquote(&path);
        if path.is_empty() || seen.contains(&path) {
            continue;
        }

        let kind = classify_xy(xy);
        seen.insert(path.clone());
        entries.push((path, kind));
    }

    entries
}

/// Parse `git diff --name-status <commit>` lines for base-commit mode.
pub(crate) fn parse_name_status(output: &str) -> Vec<(String, FileChangeKind)> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let Some(status) = fields.next() else { continue };
        let Some(first_path) = fields.next() else { continue };
        // Renames carry `old\tnew`; keep the destination.
        let path = fields.next().unwrap_or(first_path);

        let kind = if status.starts_with('D') {
            FileChangeKind::Deleted
        } else {
            FileChangeKind::Staged
        };
        let path = unquote(path);
        if !path.is_empty() {
            entries.push((path, kind));
        }
    }
    entries
}

fn classify_xy(xy: &str) -> FileChangeKind {
    let mut chars = xy.chars();
    let index = chars.next().unwrap_or('.');
    let worktree = chars.next().unwrap_or('.');

    if index == 'D' || worktree == 'D' {
        FileChangeKind::Deleted
    } else if xy == "??" {
        FileChangeKind::Untracked
    } else if index != '.' && index != '?' {
        FileChangeKind::Staged
    } else {
        FileChangeKind::Unstaged
    }
}

fn unquote(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// One `git check-ignore --stdin` call batched over all candidates.
async fn batch_check_ignore(repo_root: &Path, paths: &[String]) -> HashSet<String> {
    use tokio::io::AsyncWriteExt;

    if paths.is_empty() {
        return HashSet::new();
    }

    let mut child = match Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(["check-ignore", "--stdin"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            log::warn!("git check-ignore unavailable: {err}");
            return HashSet::new();
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let joined = paths.join("\n");
        let _ = stdin.write_all(joined.as_bytes()).await;
    }

    match child.wait_with_output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(err) => {
            log::warn!("git check-ignore failed: {err}");
            HashSet::new()
        }
    }
}

async fn git(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
