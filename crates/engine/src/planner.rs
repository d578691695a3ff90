use scanner_protocol::text::estimate_tokens;
use std::collections::BTreeMap;

/// Share of the context window available for file content in one
/// request; the rest is prompts and response headroom.
const PROMPT_BUDGET_FRACTION: f64 = 0.55;

/// One model request's worth of files, in deterministic path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub files: Vec<(String, String)>,
}

impl Batch {
    fn tokens(&self) -> usize {
        self.files.iter().map(|(_, c)| estimate_tokens(c)).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub batches: Vec<Batch>,
    pub skipped_oversized: Vec<String>,
}

/// Pack files into batches under `0.55 × context_limit` tokens.
///
/// Whole set first; otherwise directory groups deepest-first, merged
/// greedily while they fit. A group that exceeds the budget on its own
/// falls apart into single-file batches, and a single file above the
/// budget never reaches the model at all.
pub fn plan_batches(files: &BTreeMap<String, String>, context_limit: usize) -> PlanOutcome {
    let budget = ((context_limit as f64) * PROMPT_BUDGET_FRACTION) as usize;
    let mut outcome = PlanOutcome::default();

    let total: usize = files.values().map(|c| estimate_tokens(c)).sum();
    if total <= budget {
        let batch = Batch {
            files: files.iter().map(|(p, c)| (p.clone(), c.clone())).collect(),
        };
        if !batch.files.is_empty() {
            outcome.batches.push(batch);
        }
        return outcome;
    }

    let mut current = Batch::default();
    for (_dir, group_paths) in directory_groups(files) {
        let mut group = Batch::default();
        for path in group_paths {
            let content = &files[&path];
            let tokens = estimate_tokens(content);
            if tokens > budget {
                log::warn!(
                    "Skipping oversized file: {path} ({tokens} tokens > {budget} available)"
                );
                outcome.skipped_oversized.push(path);
                continue;
            }
            group.files.push((path, content.clone()));
        }
        if group.files.is_empty() {
            continue;
        }

        let group_tokens = group.tokens();
        if group_tokens > budget {
            // Siblings alone blow the budget; each file stands alone.
            if !current.files.is_empty() {
                outcome.batches.push(std::mem::take(&mut current));
            }
            for (path, content) in group.files {
                outcome.batches.push(Batch {
                    files: vec![(path, content)],
                });
            }
        } else if current.tokens() + group_tokens <= budget {
            current.files.extend(group.files);
        } else {
            if !current.files.is_empty() {
                outcome.batches.push(std::mem::take(&mut current));
            }
            current = group;
        }
    }
    if !current.files.is_empty() {
        outcome.batches.push(current);
    }

    outcome
}

/// Files grouped by parent directory, deepest directories first so
/// batching collapses leaves before the root.
fn directory_groups(files: &BTreeMap<String, String>) -> Vec<(String, Vec<String>)> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in files.keys() {
        let parent = match path.rfind('/') {
            Some(pos) => path[..pos].to_string(),
            None => String::new(),
        };
        groups.entry(parent).or_default().push(path.clone());
    }

    let mut ordered: Vec<(String, Vec<String>)> = groups.into_iter().collect();
    ordered.sort_by(|a, b| {
        let depth_a = a.0.matches('/').count() + usize::from(!a.0.is_empty());
        let depth_b = b.0.matches('/').count() + usize::from(!b.0.is_empty());
        depth_b.cmp(&depth_a).then_with(|| a.0.cmp(&b.0))
    });
    ordered
}
