use crate::error::{ToolError, ToolResult};
use crate::paths::resolve_repo_path;
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;

const MAX_CONTEXT_LINES: u32 = 10;

/// Unified diff of one file against HEAD. Untracked files diff against
/// the null tree so new code is visible too.
pub(crate) async fn get_file_diff(
    root: &Path,
    file_path: &str,
    context_lines: u32,
) -> ToolResult<Value> {
    let context = context_lines.min(MAX_CONTEXT_LINES);
    resolve_repo_path(root, file_path)?;

    let tracked = git_output(
        root,
        &["ls-files", "--error-unmatch", "--", file_path],
    )
    .await
    .is_ok();

    let unified = format!("-U{context}");
    let diff = if tracked {
        git_output(root, &["diff", &unified, "HEAD", "--", file_path])
            .await
            .map_err(|e| ToolError::Execution(format!("git diff failed: {e}")))?
    } else {
        // --no-index exits 1 when the files differ; that is the diff.
        let output = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(["diff", "--no-index", &unified, "--", null_device(), file_path])
            .output()
            .await?;
        String::from_utf8_lossy(&output.stdout).into_owned()
    };

    Ok(json!({
        "success": true,
        "file_path": file_path,
        "context_lines": context,
        "has_changes": !diff.trim().is_empty(),
        "diff": diff,
    }))
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

async fn git_output(root: &Path, args: &[&str]) -> std::io::Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
