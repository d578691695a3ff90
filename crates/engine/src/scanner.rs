use crate::planner::plan_batches;
use crate::report::ReportWriter;
use crate::tracker::IssueTracker;
use chrono::Local;
use scanner_gitwatch::{ChangeSetCell, FileFilter, WatcherState};
use scanner_llm::{prompt, LlmClient, LlmError, MAX_TOOL_ITERATIONS};
use scanner_protocol::text::sha256_hex;
use scanner_protocol::{ChangeSet, Config, FileSnapshot, Issue};
use scanner_tools::ToolExecutor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// What happened to one batch query.
enum BatchOutcome {
    Issues(Vec<Issue>),
    Failed,
    Shutdown,
}

/// Serial scan engine implementing the watermark re-scan algorithm.
///
/// A pass walks the check schedule in order, consuming the freshest
/// ChangeSet before each check. When a mid-pass mutation invalidates an
/// already-executed index, only the stale prefix `[0, k]` is re-run,
/// repeating until a pass completes clean. At idle, every check has
/// executed against content equal to the current worktree for every
/// file it scanned.
pub struct Scanner {
    config: Config,
    cell: ChangeSetCell,
    filter: Arc<FileFilter>,
    client: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    tracker: IssueTracker,
    report: ReportWriter,
    shutdown: watch::Receiver<bool>,
    files_scanned: usize,
    checks_run: usize,
    skipped_oversized: usize,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        cell: ChangeSetCell,
        filter: Arc<FileFilter>,
        client: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        tracker: IssueTracker,
        report: ReportWriter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            cell,
            filter,
            client,
            executor,
            tracker,
            report,
            shutdown,
            files_scanned: 0,
            checks_run: 0,
            skipped_oversized: 0,
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn run(mut self) {
        log::info!("Scanner loop started");
        let mut last_seq = 0u64;

        loop {
            if self.is_shutdown() {
                break;
            }

            let Some((seq, state)) = self.next_state(last_seq).await else {
                break;
            };
            last_seq = seq;

            match state {
                WatcherState::Starting | WatcherState::Wait => continue,
                WatcherState::Ready(set) => {
                    self.executor.ctags().mark_dirty();
                    if set.is_empty() {
                        log::debug!("No changes detected, idle");
                        continue;
                    }
                    last_seq = self.run_scan_cycle(seq, set).await;
                }
            }
        }
        log::info!("Scanner loop ended");
    }

    /// Wait for a publication newer than `seen`, or for shutdown.
    async fn next_state(&mut self, seen: u64) -> Option<(u64, WatcherState)> {
        loop {
            tokio::select! {
                published = self.cell.wait_newer(seen) => return Some(published),
                _ = self.shutdown.changed() => {
                    if self.is_shutdown() {
                        return None;
                    }
                }
            }
        }
    }

    /// One full scan cycle: repeat passes until one completes without a
    /// mid-pass mutation, then the watermark covers the whole schedule.
    async fn run_scan_cycle(&mut self, mut seq: u64, mut current: ChangeSet) -> u64 {
        let schedule = self.config.schedule();
        let mut upper = schedule.len();
        log::info!(
            "Starting scan: {} changed file(s), {} check(s)",
            current.files.len(),
            schedule.len()
        );

        loop {
            let mut visited: Vec<(usize, FileSnapshot)> = Vec::new();
            let mut stale_upper: Option<usize> = None;

            for i in 0..upper {
                if self.is_shutdown() {
                    return seq;
                }

                // Consume the freshest ChangeSet before this check.
                let (new_seq, state) = self.cell.latest();
                if new_seq != seq {
                    seq = new_seq;
                    match state {
                        WatcherState::Ready(set) => {
                            if set != current {
                                self.executor.ctags().mark_dirty();
                                if let Some(k) = stale_prefix_index(&visited, &set, &self.config, &schedule, &self.filter) {
                                    stale_upper =
                                        Some(stale_upper.map_or(k, |prev| prev.max(k)));
                                    log::info!(
                                        "Mid-scan mutation detected; stale prefix now [0, {k}]"
                                    );
                                }
                                current = set;
                            }
                        }
                        WatcherState::Wait => {
                            log::info!("Waiting for merge/rebase to complete...");
                            let Some((wait_seq, wait_state)) = self.next_state(seq).await else {
                                return seq;
                            };
                            seq = wait_seq;
                            if let WatcherState::Ready(set) = wait_state {
                                self.executor.ctags().mark_dirty();
                                if let Some(k) = stale_prefix_index(&visited, &set, &self.config, &schedule, &self.filter) {
                                    stale_upper =
                                        Some(stale_upper.map_or(k, |prev| prev.max(k)));
                                }
                                current = set;
                            }
                        }
                        WatcherState::Starting => {}
                    }
                }

                let (group_idx, prompt_idx) = schedule[i];
                match self.run_check(group_idx, prompt_idx, i, schedule.len(), &current).await {
                    Some(snapshot) => visited.push((i, snapshot)),
                    None => return seq,
                }
            }

            match stale_upper {
                Some(k) => {
                    log::info!("Re-running stale checks [0, {k}] against fresh content");
                    upper = k + 1;
                }
                None => break,
            }
        }

        log::info!(
            "Scan complete: {} open, {} resolved; entering idle",
            self.tracker.open_count(),
            self.tracker.resolved_count()
        );
        seq
    }

    /// Execute one check: read fresh file contents, plan batches, query
    /// the model, then ingest the union and rewrite the report once.
    ///
    /// Returns the content snapshot the check consumed, or `None` when
    /// shutdown interrupted it (nothing partial is ingested).
    async fn run_check(
        &mut self,
        group_idx: usize,
        prompt_idx: usize,
        schedule_index: usize,
        schedule_len: usize,
        current: &ChangeSet,
    ) -> Option<FileSnapshot> {
        let group = self.config.check_groups[group_idx].clone();
        let check_prompt = group.prompts[prompt_idx].clone();
        log::info!(
            "Running check {}/{}: {}",
            schedule_index + 1,
            schedule_len,
            check_prompt.chars().take(50).collect::<String>()
        );

        let mut snapshot = FileSnapshot::default();
        let mut files: BTreeMap<String, String> = BTreeMap::new();
        let mut deleted: Vec<String> = Vec::new();

        for file in &current.files {
            if !group.matches_file(&file.path) || !self.filter.included(&file.path) {
                continue;
            }
            if file.is_deleted() {
                deleted.push(file.path.clone());
                continue;
            }

            let full_path = self.config.target_directory.join(&file.path);
            if scanner_protocol::text::is_binary_file(&full_path) {
                log::debug!("Skipping binary file: {}", file.path);
                continue;
            }
            match std::fs::read(&full_path) {
                Ok(bytes) => {
                    snapshot.record(&file.path, &sha256_hex(&bytes));
                    files.insert(
                        file.path.clone(),
                        String::from_utf8_lossy(&bytes).into_owned(),
                    );
                }
                Err(err) => log::warn!("Could not read file {}: {err}", file.path),
            }
        }

        if files.is_empty() && deleted.is_empty() {
            log::debug!("No files match pattern '{}', skipping check", group.pattern);
            return Some(snapshot);
        }

        let plan = plan_batches(&files, self.client.context_limit());
        self.skipped_oversized += plan.skipped_oversized.len();

        let mut issues: Vec<Issue> = Vec::new();
        let mut scanned: Vec<String> = deleted.clone();
        for batch in &plan.batches {
            let user_prompt = prompt::build_user_prompt(&check_prompt, &batch.files);
            match self.query_batch(&user_prompt).await {
                BatchOutcome::Issues(batch_issues) => {
                    issues.extend(batch_issues);
                    scanned.extend(batch.files.iter().map(|(p, _)| p.clone()));
                }
                BatchOutcome::Failed => {
                    // A failed batch contributes no scanned files, so
                    // resolution never fires from a failed check.
                }
                BatchOutcome::Shutdown => return None,
            }
        }

        self.checks_run += 1;
        self.files_scanned = self.files_scanned.max(files.len());

        let issues = self.sanitize(issues, &check_prompt);
        let outcome = self.tracker.ingest(issues, &scanned);
        if outcome.new_count > 0 || outcome.resolved_count > 0 {
            log::info!(
                "Check complete: {} new, {} resolved",
                outcome.new_count,
                outcome.resolved_count
            );
        }

        let status = format!(
            "Files scanned: {}, checks run: {}, oversized skipped: {}",
            self.files_scanned, self.checks_run, self.skipped_oversized
        );
        if let Err(err) = self.report.write(&self.tracker.by_file(), &status) {
            log::error!("Could not write report: {err}");
        }

        Some(snapshot)
    }

    /// Query one batch. Transport failures pause the scanner and retry
    /// the exact call every 10 s; protocol failures and context
    /// overflows abandon the batch.
    async fn query_batch(&mut self, user_prompt: &str) -> BatchOutcome {
        loop {
            if self.is_shutdown() {
                return BatchOutcome::Shutdown;
            }

            let query = self.client.query(
                prompt::SYSTEM_PROMPT,
                user_prompt,
                Some(self.executor.as_ref()),
                MAX_TOOL_ITERATIONS,
            );
            let result = tokio::select! {
                result = query => result,
                _ = self.shutdown.changed() => return BatchOutcome::Shutdown,
            };

            match result {
                Ok(report) => {
                    let timestamp = Local::now();
                    let issues = report
                        .issues
                        .into_iter()
                        .map(|r| r.into_issue("", timestamp))
                        .collect();
                    return BatchOutcome::Issues(issues);
                }
                Err(err) if err.is_transport() => {
                    log::warn!("Lost LLM connection, pausing scanner: {err}");
                    let wait = self
                        .client
                        .wait_for_connection(self.config.llm_retry_interval());
                    tokio::select! {
                        _ = wait => {}
                        _ = self.shutdown.changed() => return BatchOutcome::Shutdown,
                    }
                }
                Err(LlmError::ContextOverflow(message)) => {
                    log::error!("Batch abandoned, context overflow: {message}");
                    return BatchOutcome::Failed;
                }
                Err(err) => {
                    log::warn!("Check failed after retries: {err}");
                    return BatchOutcome::Failed;
                }
            }
        }
    }

    /// Drop issues referencing paths outside the target or empty paths,
    /// and stamp the producing check onto the survivors.
    fn sanitize(&self, issues: Vec<Issue>, check_prompt: &str) -> Vec<Issue> {
        issues
            .into_iter()
            .filter_map(|mut issue| {
                let path = issue.file_path.trim_start_matches("./").to_string();
                if path.is_empty()
                    || path.starts_with('/')
                    || path.split('/').any(|part| part == "..")
                {
                    log::debug!("Discarding issue with invalid path: '{}'", issue.file_path);
                    return None;
                }
                issue.file_path = path;
                issue.check_prompt = check_prompt.to_string();
                Some(issue)
            })
            .collect()
    }
}

/// The highest already-visited schedule index invalidated by the new
/// ChangeSet: a visited file whose content hash changed or disappeared,
/// or a newly appearing file a visited check's pattern would have
/// scanned. The re-pass covers `[0, k]`; every index above k consumed
/// content at least as fresh as the detected change.
fn stale_prefix_index(
    visited: &[(usize, FileSnapshot)],
    new_set: &ChangeSet,
    config: &Config,
    schedule: &[(usize, usize)],
    filter: &FileFilter,
) -> Option<usize> {
    let mut stale_upper: Option<usize> = None;
    let mut note = |idx: usize| {
        stale_upper = Some(stale_upper.map_or(idx, |prev| prev.max(idx)));
    };

    for (idx, snapshot) in visited {
        for path in snapshot.paths() {
            if new_set.hash_of(path) != snapshot.get(path) {
                note(*idx);
                break;
            }
        }
    }

    // A file added since the pass began invalidates every visited check
    // whose pattern covers it.
    for file in &new_set.files {
        if file.is_deleted() || !filter.included(&file.path) {
            continue;
        }
        let already_seen = visited
            .iter()
            .any(|(_, snapshot)| snapshot.get(&file.path).is_some());
        if already_seen {
            continue;
        }
        for (idx, _) in visited {
            let (group_idx, _) = schedule[*idx];
            if config.check_groups[group_idx].matches_file(&file.path) {
                note(*idx);
            }
        }
    }

    stale_upper
}
