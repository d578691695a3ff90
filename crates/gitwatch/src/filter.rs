use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Unified exclusion predicate built once per scan cycle.
///
/// Merges three sources, checked cheapest first:
/// 1. scanner-owned filenames (report, backup, log) at the repo root,
/// 2. ignore-group patterns from configuration, including the
///    `/*name*/` directory form,
/// 3. gitignore rules matched in memory (no subprocess per query).
pub struct FileFilter {
    repo_root: PathBuf,
    scanner_files: HashSet<String>,
    config_patterns: Vec<String>,
    gitignore: Option<Gitignore>,
}

impl FileFilter {
    pub fn new(repo_root: &Path, scanner_files: Vec<String>, config_patterns: Vec<String>) -> Self {
        let gitignore = load_gitignore(repo_root);
        if gitignore.is_none() {
            log::debug!("No usable .gitignore rules; gitignore filtering disabled");
        }
        Self {
            repo_root: repo_root.to_path_buf(),
            scanner_files: scanner_files.into_iter().collect(),
            config_patterns,
            gitignore,
        }
    }

    pub fn included(&self, path: &str) -> bool {
        self.skip_reason(path).is_none()
    }

    /// Why a path is excluded, or `None` when it passes.
    pub fn skip_reason(&self, path: &str) -> Option<String> {
        let path = path.trim_start_matches("./");
        let basename = path.rsplit('/').next().unwrap_or(path);

        if self.scanner_files.contains(path) || self.scanner_files.contains(basename) {
            return Some("scanner_file".to_string());
        }

        for pattern in &self.config_patterns {
            if matches_config_pattern(pattern, path, basename) {
                return Some(format!("config_pattern:{pattern}"));
            }
        }

        if let Some(gitignore) = &self.gitignore {
            let is_dir = self.repo_root.join(path).is_dir();
            if gitignore.matched_path_or_any_parents(path, is_dir).is_ignore() {
                return Some("gitignore".to_string());
            }
        }

        None
    }

    pub fn is_gitignored(&self, path: &str) -> bool {
        matches!(self.skip_reason(path).as_deref(), Some("gitignore"))
    }

    /// Whether in-memory gitignore matching is available. When it is
    /// not, the watcher falls back to one batched `git check-ignore`.
    pub fn has_gitignore_engine(&self) -> bool {
        self.gitignore.is_some()
    }
}

fn load_gitignore(repo_root: &Path) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(repo_root);
    let mut added = false;

    let root_ignore = repo_root.join(".gitignore");
    if root_ignore.exists() {
        if let Some(err) = builder.add(&root_ignore) {
            log::warn!("Could not parse {}: {err}", root_ignore.display());
        } else {
            added = true;
        }
    }

    let info_exclude = repo_root.join(".git").join("info").join("exclude");
    if info_exclude.exists() && builder.add(&info_exclude).is_none() {
        added = true;
    }

    if !added {
        return None;
    }

    match builder.build() {
        Ok(gitignore) => Some(gitignore),
        Err(err) => {
            log::warn!("Could not build gitignore matcher: {err}");
            None
        }
    }
}

/// Config pattern matching. `/*name*/` matches any path traversing a
/// directory whose name matches `name` (wildcards allowed inside);
/// plain patterns are shell globs tried against the basename and the
/// full relative path.
fn matches_config_pattern(pattern: &str, path: &str, basename: &str) -> bool {
    if let Some(dir_pattern) = pattern.strip_prefix("/*").and_then(|p| p.strip_suffix('/')) {
        let Ok(compiled) = glob::Pattern::new(dir_pattern) else {
            return false;
        };
        return path.split('/').any(|part| compiled.matches(part));
    }

    let Ok(compiled) = glob::Pattern::new(pattern) else {
        return false;
    };
    compiled.matches(basename) || compiled.matches(path)
}
