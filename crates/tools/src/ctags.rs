use crate::error::{ToolError, ToolResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

const CTAGS_TIMEOUT: Duration = Duration::from_secs(300);

const CTAGS_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "build",
    "dist",
    "target",
    "*.min.js",
    "*.min.css",
    "*.map",
    "coverage",
];

/// A symbol parsed from Universal Ctags JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub name: String,
    pub file_path: String,
    pub line: u32,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip)]
    pub end_line: Option<u32>,
}

impl Symbol {
    fn from_ctags_json(data: &Value) -> Option<Self> {
        if data.get("_type").and_then(Value::as_str) != Some("tag") {
            return None;
        }
        let name = data.get("name")?.as_str()?.to_string();
        let file_path = data
            .get("path")?
            .as_str()?
            .trim_start_matches("./")
            .to_string();
        let line = data.get("line").and_then(Value::as_u64).unwrap_or(0) as u32;

        Some(Self {
            name,
            file_path,
            line,
            kind: data
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            scope: field_str(data, "scope"),
            scope_kind: field_str(data, "scopeKind"),
            signature: field_str(data, "signature"),
            access: field_str(data, "access"),
            language: field_str(data, "language"),
            end_line: data.get("end").and_then(Value::as_u64).map(|e| e as u32),
        })
    }
}

fn field_str(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Single-letter ctags kinds expanded to common names.
fn expand_kind(kind: &str) -> &str {
    match kind {
        "f" => "function",
        "c" => "class",
        "m" => "method",
        "v" => "variable",
        "d" => "macro",
        "t" => "type",
        "s" => "struct",
        "e" => "enum",
        "g" => "enum_value",
        "n" => "namespace",
        "i" => "interface",
        "p" => "property",
        "M" => "member",
        "F" => "field",
        "I" => "import",
        "C" => "constant",
        "P" => "impl",
        other => other,
    }
}

/// Kind filter matching with the usual aliases (function/method,
/// class/struct, ...). Empty filters match everything.
pub(crate) fn matches_kind(symbol_kind: &str, filter: &str) -> bool {
    if symbol_kind.is_empty() || filter.is_empty() {
        return true;
    }
    let symbol = expand_kind(symbol_kind).to_lowercase();
    let filter = filter.to_lowercase();
    if symbol == filter {
        return true;
    }

    let aliases: &[(&str, &[&str])] = &[
        ("function", &["function", "method", "func"]),
        ("method", &["method", "function"]),
        ("class", &["class", "struct", "interface", "trait"]),
        ("variable", &["variable", "var"]),
        ("constant", &["constant", "const", "macro"]),
        ("type", &["type", "typedef"]),
    ];
    aliases
        .iter()
        .any(|(key, members)| *key == filter && members.contains(&symbol.as_str()))
}

#[derive(Default)]
struct IndexState {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, Vec<usize>>,
    by_file: HashMap<String, Vec<usize>>,
    built: bool,
}

/// In-memory symbol index over Universal Ctags output.
///
/// The index is shared by all tools and refreshed lazily: the scanner
/// marks it dirty when the worktree changes and the next symbol lookup
/// rebuilds it.
pub struct CtagsIndex {
    repo_root: PathBuf,
    ctags_path: PathBuf,
    state: RwLock<IndexState>,
    dirty: AtomicBool,
}

impl CtagsIndex {
    /// Verify Universal Ctags is installed and build an empty index.
    pub fn new(repo_root: &Path) -> ToolResult<Self> {
        let ctags_path = verify_ctags()?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            ctags_path,
            state: RwLock::new(IndexState::default()),
            dirty: AtomicBool::new(true),
        })
    }

    /// Flag the index stale; the next lookup regenerates it.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn ensure_fresh(&self) -> ToolResult<()> {
        if !self.dirty.load(Ordering::Relaxed) && self.state.read().await.built {
            return Ok(());
        }
        self.generate().await
    }

    async fn generate(&self) -> ToolResult<()> {
        log::info!("Generating ctags index for {}", self.repo_root.display());

        let mut cmd = tokio::process::Command::new(&self.ctags_path);
        cmd.current_dir(&self.repo_root)
            .args(["--output-format=json", "--fields=*", "--extras=*", "-R"]);
        for exclude in CTAGS_EXCLUDES {
            cmd.arg(format!("--exclude={exclude}"));
        }
        cmd.arg(".");

        let output = tokio::time::timeout(CTAGS_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ToolError::Execution("ctags timed out after 5 minutes".to_string()))??;

        if !output.status.success() {
            return Err(ToolError::Execution(format!(
                "ctags failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }

        let mut state = IndexState {
            built: true,
            ..Default::default()
        };
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(data) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let Some(symbol) = Symbol::from_ctags_json(&data) else {
                continue;
            };
            let idx = state.symbols.len();
            state
                .by_name
                .entry(symbol.name.to_lowercase())
                .or_default()
                .push(idx);
            state
                .by_file
                .entry(symbol.file_path.clone())
                .or_default()
                .push(idx);
            state.symbols.push(symbol);
        }

        log::info!(
            "Indexed {} symbols from {} files",
            state.symbols.len(),
            state.by_file.len()
        );
        *self.state.write().await = state;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Case-insensitive name lookup with optional kind filter.
    pub async fn find_symbol(&self, name: &str, kind: Option<&str>) -> Vec<Symbol> {
        let state = self.state.read().await;
        let Some(indices) = state.by_name.get(&name.to_lowercase()) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|&i| &state.symbols[i])
            .filter(|s| kind.map_or(true, |k| matches_kind(&s.kind, k)))
            .cloned()
            .collect()
    }

    /// Wildcard lookup over all symbol names (`*` and `?`).
    pub async fn find_by_pattern(
        &self,
        pattern: &str,
        kind: Option<&str>,
        case_sensitive: bool,
    ) -> Vec<Symbol> {
        let compiled = if case_sensitive {
            glob::Pattern::new(pattern)
        } else {
            glob::Pattern::new(&pattern.to_lowercase())
        };
        let Ok(compiled) = compiled else {
            return Vec::new();
        };

        let state = self.state.read().await;
        state
            .symbols
            .iter()
            .filter(|s| {
                let name = if case_sensitive {
                    s.name.clone()
                } else {
                    s.name.to_lowercase()
                };
                compiled.matches(&name) && kind.map_or(true, |k| matches_kind(&s.kind, k))
            })
            .cloned()
            .collect()
    }

    /// Symbols defined in one file, ordered by line.
    pub async fn symbols_in_file(&self, path: &str, kind: Option<&str>) -> Vec<Symbol> {
        let normalized = path.trim_start_matches("./");
        let state = self.state.read().await;
        let Some(indices) = state.by_file.get(normalized) else {
            return Vec::new();
        };
        let mut symbols: Vec<Symbol> = indices
            .iter()
            .map(|&i| &state.symbols[i])
            .filter(|s| kind.map_or(true, |k| matches_kind(&s.kind, k)))
            .cloned()
            .collect();
        symbols.sort_by_key(|s| s.line);
        symbols
    }

    /// Whether `(file, line)` is a definition of `name` per the index.
    pub async fn is_definition(&self, name: &str, file: &str, line: u32) -> bool {
        self.find_symbol(name, None)
            .await
            .iter()
            .any(|s| s.file_path == file.trim_start_matches("./") && s.line == line)
    }

    /// The innermost symbol whose extent contains the given line.
    pub async fn enclosing_scope(&self, path: &str, line: u32) -> Option<Symbol> {
        let symbols = self.symbols_in_file(path, None).await;
        symbols
            .into_iter()
            .filter(|s| {
                s.line <= line && s.end_line.map_or(true, |end| line <= end)
            })
            .max_by_key(|s| s.line)
    }

    /// Hierarchical view of a file: classes with members, free
    /// functions, variables, imports.
    pub async fn file_structure(&self, path: &str) -> Value {
        let symbols = self.symbols_in_file(path, None).await;

        let mut classes: Vec<Value> = Vec::new();
        let mut class_index: HashMap<String, usize> = HashMap::new();
        let mut functions = Vec::new();
        let mut variables = Vec::new();
        let mut imports = Vec::new();
        let mut other = Vec::new();

        for symbol in &symbols {
            match expand_kind(&symbol.kind) {
                "class" | "struct" | "interface" | "trait" => {
                    class_index.insert(symbol.name.clone(), classes.len());
                    classes.push(serde_json::json!({
                        "name": symbol.name,
                        "line": symbol.line,
                        "kind": expand_kind(&symbol.kind),
                        "methods": [],
                        "properties": [],
                    }));
                }
                "function" | "method" => {
                    let entry = serde_json::json!({
                        "name": symbol.name,
                        "line": symbol.line,
                        "signature": symbol.signature,
                    });
                    match member_slot(&mut classes, &class_index, symbol.scope.as_deref(), "methods") {
                        Some(methods) => methods.push(entry),
                        None => functions.push(entry),
                    }
                }
                "property" | "member" | "field" => {
                    let entry = serde_json::json!({"name": symbol.name, "line": symbol.line});
                    match member_slot(&mut classes, &class_index, symbol.scope.as_deref(), "properties") {
                        Some(properties) => properties.push(entry),
                        None => variables.push(entry),
                    }
                }
                "variable" | "constant" | "macro" => {
                    variables.push(serde_json::json!({"name": symbol.name, "line": symbol.line}))
                }
                "import" => {
                    imports.push(serde_json::json!({"name": symbol.name, "line": symbol.line}))
                }
                kind => other.push(serde_json::json!({
                    "name": symbol.name,
                    "line": symbol.line,
                    "kind": kind,
                })),
            }
        }

        serde_json::json!({
            "file_path": path,
            "classes": classes,
            "functions": functions,
            "variables": variables,
            "imports": imports,
            "other": other,
        })
    }
}

fn member_slot<'a>(
    classes: &'a mut [Value],
    class_index: &HashMap<String, usize>,
    scope: Option<&str>,
    slot: &str,
) -> Option<&'a mut Vec<Value>> {
    let idx = *class_index.get(scope?)?;
    classes.get_mut(idx)?.get_mut(slot)?.as_array_mut()
}

fn verify_ctags() -> ToolResult<PathBuf> {
    let ctags_path = which::which("ctags").map_err(|_| {
        ToolError::MissingBinary(
            "Universal Ctags not found.\n\
             The scanner requires Universal Ctags for symbol indexing.\n\
             Install it:\n\
             \x20 Ubuntu/Debian: sudo apt install universal-ctags\n\
             \x20 macOS:         brew install universal-ctags"
                .to_string(),
        )
    })?;

    let output = std::process::Command::new(&ctags_path)
        .arg("--version")
        .output()
        .map_err(|e| ToolError::Execution(format!("failed to run ctags: {e}")))?;
    let version = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !version.contains("Universal Ctags") {
        return Err(ToolError::MissingBinary(format!(
            "Wrong ctags flavor found at {}.\n\
             The scanner requires Universal Ctags (JSON output support), got:\n{}",
            ctags_path.display(),
            version.lines().next().unwrap_or_default(),
        )));
    }

    log::info!("Found Universal Ctags: {}", ctags_path.display());
    Ok(ctags_path)
}
