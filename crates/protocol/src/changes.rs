use std::collections::BTreeMap;

/// How a path shows up in `git status` relative to the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Staged,
    Unstaged,
    Untracked,
    Deleted,
}

/// One uncommitted path as the Git watcher sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    /// Repo-relative path with forward slashes.
    pub path: String,
    pub kind: FileChangeKind,
    /// SHA-256 of the worktree content; `None` for deleted files.
    pub content_hash: Option<String>,
}

impl ChangedFile {
    pub fn is_deleted(&self) -> bool {
        self.kind == FileChangeKind::Deleted
    }
}

/// The set of paths the watcher currently considers uncommitted and not
/// excluded. Published whole into the latest-wins cell; the scanner
/// always consumes the most recent one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Ordered by path for deterministic batching and reporting.
    pub files: Vec<ChangedFile>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.content_hash.as_deref())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// Diff against a previously published set, in content-hash terms.
    pub fn delta_from(&self, previous: &ChangeSet) -> ChangeDelta {
        let mut delta = ChangeDelta::default();
        for file in &self.files {
            match previous.files.iter().find(|p| p.path == file.path) {
                None => delta.added.push(file.path.clone()),
                Some(prev) if prev.content_hash != file.content_hash => {
                    delta.modified.push(file.path.clone());
                }
                Some(_) => {}
            }
        }
        for prev in &previous.files {
            if !self.contains(&prev.path) {
                delta.removed.push(prev.path.clone());
            }
        }
        delta
    }
}

/// `{ added, removed, modified_by_content }` between two change sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ChangeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// `{ path -> content_hash }` captured at the moment files are read for
/// a batch. Identity is content, not mtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    pub hashes: BTreeMap<String, String>,
}

impl FileSnapshot {
    pub fn record(&mut self, path: &str, content_hash: &str) {
        self.hashes.insert(path.to_string(), content_hash.to_string());
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.hashes.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.hashes.get(path).map(String::as_str)
    }
}
