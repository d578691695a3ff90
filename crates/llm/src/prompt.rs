//! Prompt templates shared by both backend variants.

/// System instructions for a check run. The response contract mirrors
/// [`scanner_protocol::IssueReport`].
pub const SYSTEM_PROMPT: &str = r#"You are a code analysis assistant. Your task is to analyze source code and identify issues based on specific checks.

CRITICAL: Your response must be ONLY a valid JSON object. Do NOT include:
- Markdown code fences (```)
- Explanations or comments before/after the JSON
- Any text outside the JSON object

REQUIRED OUTPUT FORMAT (copy this structure exactly):
{"issues": [{"file": "path/to/file.ext", "line_number": 42, "description": "Issue description", "suggested_fix": "How to fix it", "code_snippet": "problematic code"}]}

Each issue in the array must have these exact keys:
- "file": string - the file path where the issue was found
- "line_number": integer - the line number (1-based)
- "description": string - clear description of the issue
- "suggested_fix": string - the suggested fix
- "code_snippet": string - the problematic code snippet

If no issues are found, return exactly: {"issues": []}

Be precise with line numbers. Only report actual issues, not potential or hypothetical ones."#;

/// System prompt for the one reformat request after a parse failure.
pub const REFORMAT_SYSTEM_PROMPT: &str = r#"You are a JSON extractor. Extract and return ONLY valid JSON. Do NOT include markdown code fences (```), explanations, or any other text. Output ONLY the raw JSON object, nothing else. Expected format: {"issues": [{"file": "...", "line_number": N, "description": "...", "suggested_fix": "...", "code_snippet": "..."}]} If the input has no valid issues, return: {"issues": []}"#;

/// Appended once the tool loop reaches 85% of the context budget.
pub const FINALIZE_INSTRUCTION: &str = "The context budget is nearly exhausted. Do not request any more tools. Respond now with your final JSON result.";

/// Cap on how much of a malformed response is echoed back for reformat.
pub const REFORMAT_INPUT_MAX_CHARS: usize = 4_000;

/// Build the user message for one check over one batch of files.
pub fn build_user_prompt(check: &str, files: &[(String, String)]) -> String {
    let mut parts = vec![
        format!("## Check to perform:\n{check}\n"),
        "## Files to analyze:\n".to_string(),
    ];
    for (path, content) in files {
        parts.push(format!("### File: {path}\n```\n{content}\n```\n"));
    }
    parts.join("\n")
}

/// Build the reformat user message from a malformed response.
pub fn build_reformat_prompt(malformed: &str) -> String {
    let clipped: String = malformed.chars().take(REFORMAT_INPUT_MAX_CHARS).collect();
    format!("Extract the JSON from this response:\n\n{clipped}")
}
