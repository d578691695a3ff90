use crate::ctags::CtagsIndex;
use crate::error::{ToolError, ToolResult};
use crate::paths::{display_path, resolve_repo_path};
use crate::search::run_ripgrep;
use crate::{diff, fs_tools};
use async_trait::async_trait;
use scanner_llm::{ToolDispatcher, ToolSchema};
use scanner_protocol::text::read_file_content;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SEARCH_PAGE_SIZE: usize = 50;
const MAX_SYMBOL_LOCATIONS: usize = 10;

/// Stateless dispatcher for the model's exploration tools.
///
/// Every call is checked against the shutdown flag, confined to the
/// repository root, and answered with either a JSON result or a
/// structured error envelope. The shared ctags index refreshes lazily
/// when the scanner marks the worktree dirty.
pub struct ToolExecutor {
    root: PathBuf,
    context_limit: usize,
    ctags: Arc<CtagsIndex>,
    shutdown: Arc<AtomicBool>,
}

impl ToolExecutor {
    pub fn new(
        root: &std::path::Path,
        context_limit: usize,
        ctags: Arc<CtagsIndex>,
        shutdown: Arc<AtomicBool>,
    ) -> ToolResult<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| ToolError::Execution(format!("bad repository root: {e}")))?;
        Ok(Self {
            root,
            context_limit,
            ctags,
            shutdown,
        })
    }

    pub fn ctags(&self) -> &Arc<CtagsIndex> {
        &self.ctags
    }

    async fn dispatch(&self, name: &str, args: &Map<String, Value>) -> ToolResult<Value> {
        match name {
            "search_text" => self.search_text(args).await,
            "read_file" => fs_tools::read_file(
                &self.root,
                self.context_limit,
                &req_str(args, "file_path")?,
                opt_usize(args, "start_line"),
                opt_usize(args, "end_line"),
            ),
            "list_directory" => fs_tools::list_directory(
                &self.root,
                args.get("directory_path")
                    .and_then(Value::as_str)
                    .unwrap_or("."),
                opt_bool(args, "recursive", false),
                opt_usize(args, "offset").unwrap_or(0),
            ),
            "get_file_diff" => {
                diff::get_file_diff(
                    &self.root,
                    &req_str(args, "file_path")?,
                    opt_usize(args, "context_lines").unwrap_or(3) as u32,
                )
                .await
            }
            "get_file_summary" => self.get_file_summary(args).await,
            "symbol_exists" => self.symbol_exists(args).await,
            "find_definition" => self.find_definition(args).await,
            "find_symbols" => self.find_symbols(args).await,
            "get_enclosing_scope" => self.get_enclosing_scope(args).await,
            "find_usages" => self.find_usages(args).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    async fn search_text(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let patterns = match args.get("patterns") {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if patterns.is_empty() {
            return Err(ToolError::InvalidArguments(
                "at least one non-empty pattern is required".to_string(),
            ));
        }

        let is_regex = opt_bool(args, "is_regex", false);
        let whole_word = opt_bool(args, "match_whole_word", true);
        let case_sensitive = opt_bool(args, "case_sensitive", false);
        let file_pattern = args.get("file_pattern").and_then(Value::as_str);
        let offset = opt_usize(args, "offset").unwrap_or(0);

        let mut matches = run_ripgrep(
            &self.root,
            &patterns,
            is_regex,
            whole_word,
            case_sensitive,
            file_pattern,
        )
        .await?;

        // Definitions sort ahead of usages so the model sees the source
        // of a symbol before its call sites.
        if self.ctags.ensure_fresh().await.is_ok() {
            let mut keyed = Vec::with_capacity(matches.len());
            for m in matches {
                let is_def = self.ctags.is_definition(&m.pattern, &m.file, m.line).await;
                keyed.push((is_def, m));
            }
            keyed.sort_by(|a, b| b.0.cmp(&a.0));
            matches = keyed.into_iter().map(|(_, m)| m).collect();
        }

        let total_matches = matches.len();
        let mut pattern_counts: BTreeMap<String, usize> = BTreeMap::new();
        for m in &matches {
            *pattern_counts.entry(m.pattern.clone()).or_default() += 1;
        }

        let page: Vec<_> = matches.into_iter().skip(offset).take(SEARCH_PAGE_SIZE).collect();
        let returned = page.len();
        let has_more = offset + returned < total_matches;
        let next_offset = has_more.then_some(offset + SEARCH_PAGE_SIZE);

        let mut by_pattern: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for m in page {
            by_pattern.entry(m.pattern.clone()).or_default().push(json!({
                "file": m.file,
                "line": m.line,
                "code": m.code,
            }));
        }

        let mut result = json!({
            "success": true,
            "patterns_searched": patterns,
            "total_matches": total_matches,
            "returned_count": returned,
            "offset": offset,
            "has_more": has_more,
            "matches_by_pattern": by_pattern,
            "pattern_match_counts": pattern_counts,
        });
        if let Some(next) = next_offset {
            result["next_offset"] = json!(next);
            result["warning"] = json!(format!(
                "PARTIAL RESULTS: showing {returned} of {total_matches} matches (offset {offset}). \
                 Call search_text again with offset={next} for more."
            ));
        }
        Ok(result)
    }

    async fn get_file_summary(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let file_path = req_str(args, "file_path")?;
        let canonical = resolve_repo_path(&self.root, &file_path)?;
        self.ctags.ensure_fresh().await?;

        let display = display_path(&self.root, &canonical);
        let mut structure = self.ctags.file_structure(&display).await;
        structure["success"] = json!(true);
        Ok(structure)
    }

    async fn symbol_exists(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let symbol = req_str(args, "symbol")?;
        let kind = args.get("kind").and_then(Value::as_str);
        self.ctags.ensure_fresh().await?;

        let found = self.ctags.find_symbol(&symbol, kind).await;
        let locations: Vec<Value> = found
            .iter()
            .take(MAX_SYMBOL_LOCATIONS)
            .map(|s| json!({"file": s.file_path, "line": s.line, "kind": s.kind}))
            .collect();

        Ok(json!({
            "success": true,
            "symbol": symbol,
            "exists": !found.is_empty(),
            "total_locations": found.len(),
            "locations": locations,
        }))
    }

    async fn find_definition(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let symbol = req_str(args, "symbol")?;
        let kind = args.get("kind").and_then(Value::as_str);
        self.ctags.ensure_fresh().await?;

        let definitions: Vec<Value> = self
            .ctags
            .find_symbol(&symbol, kind)
            .await
            .iter()
            .map(|s| {
                json!({
                    "file": s.file_path,
                    "line": s.line,
                    "kind": s.kind,
                    "scope": s.scope,
                    "signature": s.signature,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "symbol": symbol,
            "total_definitions": definitions.len(),
            "definitions": definitions,
        }))
    }

    async fn find_symbols(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let pattern = req_str(args, "pattern")?;
        let kind = args.get("kind").and_then(Value::as_str);
        let case_sensitive = opt_bool(args, "case_sensitive", false);
        self.ctags.ensure_fresh().await?;

        let symbols: Vec<Value> = self
            .ctags
            .find_by_pattern(&pattern, kind, case_sensitive)
            .await
            .iter()
            .map(|s| json!({"name": s.name, "file": s.file_path, "line": s.line, "kind": s.kind}))
            .collect();

        Ok(json!({
            "success": true,
            "pattern": pattern,
            "total_symbols": symbols.len(),
            "symbols": symbols,
        }))
    }

    async fn get_enclosing_scope(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let file_path = req_str(args, "file_path")?;
        let line = opt_usize(args, "line")
            .ok_or_else(|| ToolError::InvalidArguments("line is required".to_string()))?
            as u32;

        let canonical = resolve_repo_path(&self.root, &file_path)?;
        self.ctags.ensure_fresh().await?;

        let display = display_path(&self.root, &canonical);
        let Some(symbol) = self.ctags.enclosing_scope(&display, line).await else {
            return Ok(json!({
                "success": true,
                "file_path": display,
                "line": line,
                "scope": Value::Null,
            }));
        };

        let source = read_file_content(&canonical)
            .map(|content| {
                let lines: Vec<&str> = content.split('\n').collect();
                let start = symbol.line.saturating_sub(1) as usize;
                let end = symbol
                    .end_line
                    .map(|e| e as usize)
                    .unwrap_or(start + 20)
                    .min(lines.len());
                lines[start.min(lines.len())..end].join("\n")
            })
            .unwrap_or_default();

        Ok(json!({
            "success": true,
            "file_path": display,
            "line": line,
            "scope": {
                "name": symbol.name,
                "kind": symbol.kind,
                "start_line": symbol.line,
                "end_line": symbol.end_line,
                "signature": symbol.signature,
                "source": source,
            },
        }))
    }

    async fn find_usages(&self, args: &Map<String, Value>) -> ToolResult<Value> {
        let symbol = req_str(args, "symbol")?;
        let path_filter = args.get("path").and_then(Value::as_str);
        let include_definitions = opt_bool(args, "include_definitions", true);
        self.ctags.ensure_fresh().await?;

        let definitions = self.ctags.find_symbol(&symbol, None).await;
        let matches = run_ripgrep(&self.root, &[symbol.clone()], false, true, true, None).await?;

        let mut usages = Vec::new();
        for m in matches {
            if let Some(prefix) = path_filter {
                if !m.file.starts_with(prefix.trim_start_matches("./")) {
                    continue;
                }
            }
            let is_def = definitions
                .iter()
                .any(|d| d.file_path == m.file && d.line == m.line);
            if is_def {
                continue;
            }
            usages.push(json!({"file": m.file, "line": m.line, "code": m.code}));
        }

        let definitions_json: Vec<Value> = if include_definitions {
            definitions
                .iter()
                .map(|d| json!({"file": d.file_path, "line": d.line, "kind": d.kind}))
                .collect()
        } else {
            Vec::new()
        };

        Ok(json!({
            "success": true,
            "symbol": symbol,
            "total_definitions": definitions.len(),
            "total_usages": usages.len(),
            "definitions": definitions_json,
            "usages": usages,
        }))
    }
}

#[async_trait]
impl ToolDispatcher for ToolExecutor {
    fn schemas(&self) -> Vec<ToolSchema> {
        tool_schemas()
    }

    async fn execute(&self, name: &str, arguments: Value) -> Value {
        if self.shutdown.load(Ordering::Relaxed) {
            return ToolError::Execution("scanner is shutting down".to_string()).to_envelope();
        }

        log::info!("Executing tool: {name} with args: {arguments}");
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return ToolError::InvalidArguments(format!("expected an object, got {other}"))
                    .to_envelope()
            }
        };

        match self.dispatch(name, &args).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("Tool {name} failed: {err}");
                err.to_envelope()
            }
        }
    }
}

fn req_str(args: &Map<String, Value>, key: &str) -> ToolResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

fn opt_usize(args: &Map<String, Value>, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn opt_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn tool_schemas() -> Vec<ToolSchema> {
    fn schema(name: &str, description: &str, parameters: Value) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    vec![
        schema(
            "search_text",
            "Search the repository for text patterns. Returns file paths, line numbers and matching lines, with symbol definitions ordered before usages. Paginated: pass the returned next_offset to continue.",
            json!({
                "type": "object",
                "properties": {
                    "patterns": {
                        "description": "Pattern or array of patterns to search for.",
                        "oneOf": [
                            {"type": "string"},
                            {"type": "array", "items": {"type": "string"}}
                        ]
                    },
                    "is_regex": {"type": "boolean", "description": "Treat patterns as regular expressions. Default false (literal)."},
                    "match_whole_word": {"type": "boolean", "description": "Match whole words only. Default true."},
                    "case_sensitive": {"type": "boolean", "description": "Default false."},
                    "file_pattern": {"type": "string", "description": "Optional glob to filter files, e.g. '*.cpp'."},
                    "offset": {"type": "integer", "minimum": 0, "description": "Skip this many results (pagination)."}
                },
                "required": ["patterns"]
            }),
        ),
        schema(
            "read_file",
            "Read a file from the repository, optionally a line range. Large files are chunked; if has_more is true, call again with the returned next_start_line.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Repo-relative path."},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1}
                },
                "required": ["file_path"]
            }),
        ),
        schema(
            "list_directory",
            "List files (with line counts) and subdirectories of a directory. Hidden and build-artifact entries are filtered. Paginated via offset/next_offset.",
            json!({
                "type": "object",
                "properties": {
                    "directory_path": {"type": "string", "description": "Repo-relative path, '.' for the root."},
                    "recursive": {"type": "boolean", "description": "Default false."},
                    "offset": {"type": "integer", "minimum": 0}
                },
                "required": ["directory_path"]
            }),
        ),
        schema(
            "get_file_diff",
            "Unified diff of a file against HEAD (untracked files diff against nothing).",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "context_lines": {"type": "integer", "minimum": 0, "maximum": 10, "description": "Context lines per hunk, default 3."}
                },
                "required": ["file_path"]
            }),
        ),
        schema(
            "get_file_summary",
            "Structured summary of a file: classes with members, functions, variables and imports, each with line numbers.",
            json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"]
            }),
        ),
        schema(
            "symbol_exists",
            "Check whether a symbol exists anywhere in the repository. Returns up to 10 locations.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "kind": {"type": "string", "description": "Optional kind filter: function, class, variable, ..."}
                },
                "required": ["symbol"]
            }),
        ),
        schema(
            "find_definition",
            "Find where a symbol is defined (go-to-definition), with scope and signature when available.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "kind": {"type": "string"}
                },
                "required": ["symbol"]
            }),
        ),
        schema(
            "find_symbols",
            "Find symbols matching a wildcard pattern (* and ?), e.g. '*Handler' or 'test_*'.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "kind": {"type": "string"},
                    "case_sensitive": {"type": "boolean", "description": "Default false."}
                },
                "required": ["pattern"]
            }),
        ),
        schema(
            "get_enclosing_scope",
            "The innermost symbol (function, class, ...) containing a line, with its source text.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "line": {"type": "integer", "minimum": 1}
                },
                "required": ["file_path", "line"]
            }),
        ),
        schema(
            "find_usages",
            "All references to a symbol, split into definitions and usages.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "path": {"type": "string", "description": "Optional path prefix to restrict the search."},
                    "include_definitions": {"type": "boolean", "description": "Default true."}
                },
                "required": ["symbol"]
            }),
        ),
    ]
}
