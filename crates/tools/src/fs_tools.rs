use crate::error::{ToolError, ToolResult};
use crate::paths::{display_path, resolve_repo_path, FILTERED_DIRS};
use scanner_protocol::text::{estimate_tokens, is_binary_file, read_file_content};
use serde_json::{json, Value};
use std::path::Path;

/// Ceiling on tokens returned by one `read_file` call.
const CHUNK_SIZE_TOKENS: usize = 4_000;
const LIST_PAGE_SIZE: usize = 100;

/// Line-ranged file read, chunked so one call never floods the model.
pub(crate) fn read_file(
    root: &Path,
    context_limit: usize,
    file_path: &str,
    start_line: Option<usize>,
    end_line: Option<usize>,
) -> ToolResult<Value> {
    let canonical = resolve_repo_path(root, file_path)?;
    if !canonical.is_file() {
        return Err(ToolError::NotAFile(file_path.to_string()));
    }
    if is_binary_file(&canonical) {
        return Err(ToolError::BinaryFile(file_path.to_string()));
    }
    let content = read_file_content(&canonical)
        .ok_or_else(|| ToolError::Execution(format!("failed to read {file_path}")))?;

    let lines: Vec<&str> = content.split('\n').collect();
    let total_lines = lines.len();
    let chunk_budget = CHUNK_SIZE_TOKENS.min(context_limit / 4).max(1);

    let start_idx = start_line.unwrap_or(1).saturating_sub(1);
    if start_idx >= total_lines {
        return Err(ToolError::InvalidArguments(format!(
            "start_line {} out of range (file has {total_lines} lines)",
            start_idx + 1
        )));
    }
    let mut end_idx = end_line.unwrap_or(total_lines).min(total_lines);
    if end_idx < start_idx {
        end_idx = total_lines;
    }

    let mut selected: Vec<&str> = lines[start_idx..end_idx].to_vec();
    let mut chunk = selected.join("\n");
    let mut warning = None;

    let tokens = estimate_tokens(&chunk);
    if tokens > chunk_budget {
        let avg = (tokens as f64 / selected.len().max(1) as f64).max(1.0);
        let keep = ((chunk_budget as f64 / avg) as usize).max(10).min(selected.len());
        selected.truncate(keep);
        chunk = selected.join("\n");
        let shown_end = start_idx + selected.len();
        warning = Some(format!(
            "PARTIAL CONTENT: this file is too large to return in full. \
             Showing lines {}-{shown_end} of {total_lines}. \
             To read more, call read_file again with start_line={}.",
            start_idx + 1,
            shown_end + 1,
        ));
    }

    let shown_end = start_idx + selected.len();
    let has_more = shown_end < total_lines;
    let is_partial = start_line.is_some() || has_more || warning.is_some();

    let mut result = json!({
        "success": true,
        "file_path": display_path(root, &canonical),
        "content": chunk,
        "start_line": start_idx + 1,
        "end_line": shown_end,
        "total_lines": total_lines,
        "lines_returned": selected.len(),
        "is_partial": is_partial,
        "has_more": has_more,
    });
    if has_more {
        result["next_start_line"] = json!(shown_end + 1);
    } else {
        result["hint"] = json!(format!(
            "This is the COMPLETE file ({total_lines} lines). No need to read it again."
        ));
    }
    if let Some(warning) = warning {
        result["warning"] = json!(warning);
    }
    Ok(result)
}

/// Directory listing with line counts for text files. Hidden entries
/// and build-artifact directories are filtered; output is paginated.
pub(crate) fn list_directory(
    root: &Path,
    directory_path: &str,
    recursive: bool,
    offset: usize,
) -> ToolResult<Value> {
    let dir = if directory_path.is_empty() { "." } else { directory_path };
    let canonical = resolve_repo_path(root, dir)?;
    if !canonical.is_dir() {
        return Err(ToolError::NotADirectory(dir.to_string()));
    }

    let mut files: Vec<Value> = Vec::new();
    let mut directories: Vec<String> = Vec::new();
    collect_entries(root, &canonical, recursive, &mut files, &mut directories);

    files.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));
    directories.sort();

    let total_files = files.len();
    let total_directories = directories.len();
    let total_items = total_files + total_directories;

    // Directories first, then files, one combined page.
    let mut items: Vec<(bool, Value)> = directories
        .into_iter()
        .map(|d| (true, json!(d)))
        .chain(files.into_iter().map(|f| (false, f)))
        .collect();
    let page: Vec<(bool, Value)> = items
        .drain(..)
        .skip(offset)
        .take(LIST_PAGE_SIZE)
        .collect();
    let returned = page.len();
    let has_more = offset + returned < total_items;
    let next_offset = has_more.then_some(offset + LIST_PAGE_SIZE);

    let (page_dirs, page_files): (Vec<_>, Vec<_>) = page.into_iter().partition(|(is_dir, _)| *is_dir);

    let mut result = json!({
        "success": true,
        "directory_path": dir,
        "directories": page_dirs.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        "files": page_files.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        "total_directories": total_directories,
        "total_files": total_files,
        "total_items": total_items,
        "returned_count": returned,
        "offset": offset,
        "has_more": has_more,
        "recursive": recursive,
    });
    if let Some(next) = next_offset {
        result["next_offset"] = json!(next);
        result["warning"] = json!(format!(
            "PARTIAL LISTING: showing {returned} of {total_items} items (offset {offset}). \
             Call list_directory again with offset={next} for more."
        ));
    }
    Ok(result)
}

fn collect_entries(
    root: &Path,
    dir: &Path,
    recursive: bool,
    files: &mut Vec<Value>,
    directories: &mut Vec<String>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || FILTERED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            directories.push(display_path(root, &path));
            if recursive {
                collect_entries(root, &path, true, files, directories);
            }
        } else if path.is_file() {
            let mut info = json!({"path": display_path(root, &path)});
            if !is_binary_file(&path) {
                if let Some(content) = read_file_content(&path) {
                    info["lines"] = json!(content.split('\n').count());
                }
            }
            files.push(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src/inner")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/junk")).unwrap();
        std::fs::write(root.join("src/app.rs"), "line one\nline two\nline three\n").unwrap();
        std::fs::write(root.join("src/inner/deep.rs"), "deep\n").unwrap();
        std::fs::write(root.join(".hidden"), "x").unwrap();
        (dir, root)
    }

    #[test]
    fn read_whole_small_file() {
        let (_guard, root) = repo();
        let result = read_file(&root, 100_000, "src/app.rs", None, None).unwrap();
        assert_eq!(result["total_lines"], 4);
        assert_eq!(result["has_more"], false);
        assert_eq!(result["is_partial"], false);
        assert!(result["content"].as_str().unwrap().contains("line two"));
        assert!(result["hint"].as_str().unwrap().contains("COMPLETE"));
    }

    #[test]
    fn read_line_range() {
        let (_guard, root) = repo();
        let result = read_file(&root, 100_000, "src/app.rs", Some(2), Some(3)).unwrap();
        assert_eq!(result["start_line"], 2);
        assert_eq!(result["end_line"], 3);
        assert_eq!(result["content"], "line two\nline three");
        assert_eq!(result["is_partial"], true);
    }

    #[test]
    fn oversized_file_is_chunked_with_next_start_line() {
        let (_guard, root) = repo();
        let big: String = (0..3000)
            .map(|i| format!("line number {i} with some padding text\n"))
            .collect();
        std::fs::write(root.join("big.txt"), &big).unwrap();

        let result = read_file(&root, 100_000, "big.txt", None, None).unwrap();
        assert_eq!(result["has_more"], true);
        assert!(result["next_start_line"].as_u64().unwrap() > 1);
        assert!(result["warning"].as_str().unwrap().contains("PARTIAL CONTENT"));
    }

    #[test]
    fn binary_file_is_refused() {
        let (_guard, root) = repo();
        std::fs::write(root.join("blob.bin"), b"\x00\x01\x02").unwrap();
        let err = read_file(&root, 100_000, "blob.bin", None, None).unwrap_err();
        assert_eq!(err.kind(), "binary_file");
    }

    #[test]
    fn listing_filters_hidden_and_artifact_dirs() {
        let (_guard, root) = repo();
        let result = list_directory(&root, ".", true, 0).unwrap();
        let dirs: Vec<&str> = result["directories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_str().unwrap())
            .collect();
        assert!(dirs.contains(&"src"));
        assert!(dirs.contains(&"src/inner"));
        assert!(!dirs.iter().any(|d| d.contains("node_modules")));

        let files = result["files"].as_array().unwrap();
        assert!(files.iter().all(|f| !f["path"].as_str().unwrap().starts_with('.')));
        assert!(files
            .iter()
            .any(|f| f["path"] == "src/app.rs" && f["lines"] == 4));
    }

    #[test]
    fn listing_paginates_past_page_size() {
        let (_guard, root) = repo();
        for i in 0..130 {
            std::fs::write(root.join(format!("f{i:03}.txt")), "x\n").unwrap();
        }
        let first = list_directory(&root, ".", false, 0).unwrap();
        assert_eq!(first["has_more"], true);
        let next = first["next_offset"].as_u64().unwrap() as usize;
        let second = list_directory(&root, ".", false, next).unwrap();
        assert_eq!(second["has_more"], false);
        let total = first["returned_count"].as_u64().unwrap()
            + second["returned_count"].as_u64().unwrap();
        assert_eq!(total, first["total_items"].as_u64().unwrap());
    }
}
