use crate::error::{ToolError, ToolResult};
use std::path::{Component, Path, PathBuf};

/// Directories never surfaced by exploration tools.
pub(crate) const FILTERED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "build",
    "dist",
    "target",
    ".git",
];

/// Resolve a repo-relative path, rejecting anything that escapes the
/// repository root. `..` components are denied before touching the
/// filesystem; the canonicalized result (symlinks followed) must still
/// land inside the root.
pub(crate) fn resolve_repo_path(root: &Path, rel: &str) -> ToolResult<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(ToolError::InvalidArguments("path must not be empty".to_string()));
    }

    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        match component {
            Component::ParentDir => return Err(ToolError::PathEscape(rel.to_string())),
            Component::Prefix(_) | Component::RootDir => {
                return Err(ToolError::PathEscape(rel.to_string()))
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let candidate = root.join(rel_path);
    let canonical = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            return Err(ToolError::NotFound {
                path: rel.to_string(),
                suggestions: similar_paths(root, rel),
            })
        }
    };

    if !canonical.starts_with(root) {
        return Err(ToolError::PathEscape(rel.to_string()));
    }
    Ok(canonical)
}

/// Repo-relative display path with forward slashes.
pub(crate) fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Candidate paths with the same (or close) basename, offered when a
/// requested file does not exist.
pub(crate) fn similar_paths(root: &Path, requested: &str) -> Vec<String> {
    const MAX_SUGGESTIONS: usize = 5;

    let wanted = Path::new(requested)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if wanted.is_empty() {
        return Vec::new();
    }
    let wanted_stem = Path::new(&wanted)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| wanted.clone());

    let mut exact = Vec::new();
    let mut close = Vec::new();
    collect_similar(root, root, &wanted, &wanted_stem, &mut exact, &mut close);

    exact.extend(close);
    exact.truncate(MAX_SUGGESTIONS);
    exact
}

fn collect_similar(
    root: &Path,
    dir: &Path,
    wanted: &str,
    wanted_stem: &str,
    exact: &mut Vec<String>,
    close: &mut Vec<String>,
) {
    if exact.len() >= 5 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() {
            if name.starts_with('.') || FILTERED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect_similar(root, &path, wanted, wanted_stem, exact, close);
        } else {
            let lower = name.to_lowercase();
            if lower == wanted {
                exact.push(display_path(root, &path));
            } else if !wanted_stem.is_empty() && lower.contains(wanted_stem) && close.len() < 5 {
                close.push(display_path(root, &path));
            }
        }
    }
}
