use scanner_protocol::{Issue, IssueStatus};
use std::collections::{BTreeMap, HashSet};

/// Minimum fuzzy similarity for two findings to be the same issue.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub new_count: usize,
    pub resolved_count: usize,
    pub migrated_count: usize,
}

/// In-memory issue store with fuzzy identity and scoped resolution.
///
/// The tracker is the sole owner of issue records. Matching never uses
/// line numbers (code moves); a RESOLVED record is frozen for the rest
/// of the session and a recurring finding opens a fresh one.
pub struct IssueTracker {
    issues: Vec<Issue>,
    threshold: f32,
}

impl IssueTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            issues: Vec::new(),
            threshold,
        }
    }

    /// Ingest the union of one check run's findings and compute
    /// resolution scoped to the files that run actually scanned.
    ///
    /// Issues on files outside `scanned_files` are left untouched.
    pub fn ingest(&mut self, new_issues: Vec<Issue>, scanned_files: &[String]) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut seen: HashSet<usize> = HashSet::new();

        for incoming in new_issues {
            match self.best_open_match(&incoming) {
                Some(idx) => {
                    let existing = &mut self.issues[idx];
                    if existing.line_number != incoming.line_number {
                        log::debug!(
                            "Issue moved: {} L{} -> L{}",
                            existing.file_path,
                            existing.line_number,
                            incoming.line_number
                        );
                        existing.line_number = incoming.line_number;
                        outcome.migrated_count += 1;
                    }
                    seen.insert(idx);
                }
                None => {
                    log::info!("New issue: {}:{}", incoming.file_path, incoming.line_number);
                    self.issues.push(incoming);
                    seen.insert(self.issues.len() - 1);
                    outcome.new_count += 1;
                }
            }
        }

        let scanned: HashSet<&str> = scanned_files.iter().map(String::as_str).collect();
        for (idx, issue) in self.issues.iter_mut().enumerate() {
            if issue.status == IssueStatus::Open
                && scanned.contains(issue.file_path.as_str())
                && !seen.contains(&idx)
            {
                log::info!("Resolved: {}:{}", issue.file_path, issue.line_number);
                issue.status = IssueStatus::Resolved;
                outcome.resolved_count += 1;
            }
        }

        outcome
    }

    /// Best OPEN match for an incoming issue: same file, highest
    /// similarity above the threshold; exact ties go to the lowest
    /// existing line number.
    fn best_open_match(&self, incoming: &Issue) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;

        for (idx, existing) in self.issues.iter().enumerate() {
            if existing.status != IssueStatus::Open || existing.file_path != incoming.file_path {
                continue;
            }
            let similarity = issue_similarity(existing, incoming);
            if similarity < self.threshold {
                continue;
            }

            best = match best {
                None => Some((idx, similarity)),
                Some((best_idx, best_sim)) => {
                    if similarity > best_sim
                        || (similarity == best_sim
                            && self.issues[idx].line_number < self.issues[best_idx].line_number)
                    {
                        Some((idx, similarity))
                    } else {
                        Some((best_idx, best_sim))
                    }
                }
            };
        }

        best.map(|(idx, _)| idx)
    }

    /// Issues grouped by file for report rendering: files sorted by
    /// path, OPEN before RESOLVED within a file, then by line.
    pub fn by_file(&self) -> BTreeMap<String, Vec<Issue>> {
        let mut grouped: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
        for issue in &self.issues {
            grouped.entry(issue.file_path.clone()).or_default().push(issue.clone());
        }
        for issues in grouped.values_mut() {
            issues.sort_by_key(|i| (i.status == IssueStatus::Resolved, i.line_number));
        }
        grouped
    }

    pub fn snapshot(&self) -> Vec<Issue> {
        self.issues.clone()
    }

    pub fn open_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.status == IssueStatus::Open)
            .count()
    }

    pub fn resolved_count(&self) -> usize {
        self.issues.len() - self.open_count()
    }
}

impl Default for IssueTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

/// Snippet similarity when both sides carry snippets, description
/// similarity otherwise.
fn issue_similarity(a: &Issue, b: &Issue) -> f32 {
    let (left, right) = if a.has_snippet() && b.has_snippet() {
        (a.identity_text(), b.identity_text())
    } else {
        (
            scanner_protocol::text::normalize_whitespace(&a.description),
            scanner_protocol::text::normalize_whitespace(&b.description),
        )
    };
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    similar::TextDiff::from_chars(left.as_str(), right.as_str()).ratio()
}
