use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REPORT_FILE_NAME: &str = "code_scanner_results.md";
pub const REPORT_BACKUP_NAME: &str = "code_scanner_results.md.bak";
pub const LOG_FILE_NAME: &str = "code_scanner.log";
pub const LOCK_FILE_NAME: &str = "code_scanner.lock";

const TOP_LEVEL_KEYS: &[&str] = &["llm", "checks"];
const LLM_KEYS: &[&str] = &["backend", "host", "port", "model", "timeout", "context_limit"];
const CHECK_KEYS: &[&str] = &["pattern", "checks"];

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const GIT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const LLM_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Which wire dialect the backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "native-chat")]
    NativeChat,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OpenAiCompatible => write!(f, "openai-compatible"),
            BackendKind::NativeChat => write!(f, "native-chat"),
        }
    }
}

/// `[llm]` section. `model` is required for native-chat backends;
/// `context_limit` is always required.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub model: Option<String>,
    pub timeout: Duration,
    pub context_limit: usize,
}

impl LlmSettings {
    pub fn base_url(&self) -> String {
        match self.backend {
            BackendKind::OpenAiCompatible => format!("http://{}:{}/v1", self.host, self.port),
            BackendKind::NativeChat => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// One `[[checks]]` group. A group with an empty prompt list is an
/// ignore group: its patterns feed the file filter and produce no work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckGroup {
    pub pattern: String,
    pub prompts: Vec<String>,
}

impl CheckGroup {
    pub fn is_ignore(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Comma-separated patterns split and trimmed, declaration order kept.
    pub fn patterns(&self) -> Vec<String> {
        self.pattern
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Shell-style match against either the basename or the full
    /// repo-relative path.
    pub fn matches_file(&self, path: &str) -> bool {
        let basename = path.rsplit('/').next().unwrap_or(path);
        for pattern in self.patterns() {
            let Ok(compiled) = glob::Pattern::new(&pattern) else {
                continue;
            };
            if compiled.matches(basename) || compiled.matches(path) {
                return true;
            }
        }
        false
    }
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_directory: PathBuf,
    pub config_file: PathBuf,
    pub commit_hash: Option<String>,
    pub check_groups: Vec<CheckGroup>,
    pub llm: LlmSettings,
    pub debug: bool,
}

impl Config {
    pub fn report_path(&self) -> PathBuf {
        self.target_directory.join(REPORT_FILE_NAME)
    }

    pub fn report_backup_path(&self) -> PathBuf {
        self.target_directory.join(REPORT_BACKUP_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.target_directory.join(LOG_FILE_NAME)
    }

    /// Lock lives in the per-user data dir so concurrent scanners are
    /// caught regardless of which worktree they target.
    pub fn lock_path(&self) -> PathBuf {
        user_data_dir().join(LOCK_FILE_NAME)
    }

    pub fn git_poll_interval(&self) -> Duration {
        GIT_POLL_INTERVAL
    }

    pub fn llm_retry_interval(&self) -> Duration {
        LLM_RETRY_INTERVAL
    }

    /// Filenames the scanner itself writes into the target directory.
    /// These must never be scanned or trigger a rescan.
    pub fn scanner_owned_files(&self) -> Vec<String> {
        vec![
            REPORT_FILE_NAME.to_string(),
            REPORT_BACKUP_NAME.to_string(),
            LOG_FILE_NAME.to_string(),
        ]
    }

    /// Ignore patterns contributed by groups with no prompts.
    pub fn ignore_patterns(&self) -> Vec<String> {
        self.check_groups
            .iter()
            .filter(|g| g.is_ignore())
            .flat_map(|g| g.patterns())
            .collect()
    }

    /// The ordered (group, prompt) schedule for one scan cycle.
    pub fn schedule(&self) -> Vec<(usize, usize)> {
        let mut schedule = Vec::new();
        for (group_idx, group) in self.check_groups.iter().enumerate() {
            for prompt_idx in 0..group.prompts.len() {
                schedule.push((group_idx, prompt_idx));
            }
        }
        schedule
    }
}

pub fn user_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".code-scanner")
}

/// Load and strictly validate the TOML configuration.
///
/// Unknown top-level sections and unknown keys under `[llm]` or
/// `[[checks]]` are fatal. The legacy shape `checks = ["…"]` at top
/// level is accepted and converted to a single group with pattern `*`.
pub fn load_config(
    target_directory: &Path,
    config_file: &Path,
    commit_hash: Option<String>,
    debug: bool,
) -> Result<Config> {
    let target_directory = target_directory
        .canonicalize()
        .map_err(|e| invalid(format!("Target directory {}: {e}", target_directory.display())))?;
    if !target_directory.is_dir() {
        return Err(invalid(format!(
            "Target path is not a directory: {}",
            target_directory.display()
        )));
    }

    if !config_file.exists() {
        return Err(invalid(format!(
            "Configuration file not found: {}\n\
             Provide one via --config or create config.toml next to the scanner.",
            config_file.display()
        )));
    }

    log::info!("Loading configuration from {}", config_file.display());
    let raw = std::fs::read_to_string(config_file)?;
    let value: toml::Value = toml::from_str(&raw)?;

    let table = value
        .as_table()
        .ok_or_else(|| invalid("Config root must be a TOML table".to_string()))?;

    for key in table.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            return Err(invalid(format!(
                "Unknown top-level section '{key}'. Accepted sections: {}",
                TOP_LEVEL_KEYS.join(", ")
            )));
        }
    }

    let llm = parse_llm(table.get("llm"))?;
    let check_groups = parse_checks(table.get("checks"))?;

    if !check_groups.iter().any(|g| !g.is_ignore()) {
        return Err(invalid(
            "No checks defined in configuration file.\n\
             Add at least one [[checks]] group with a non-empty 'checks' list."
                .to_string(),
        ));
    }

    let config = Config {
        target_directory,
        config_file: config_file.to_path_buf(),
        commit_hash,
        check_groups,
        llm,
        debug,
    };

    let total: usize = config.check_groups.iter().map(|g| g.prompts.len()).sum();
    log::info!(
        "Loaded {} check group(s), {total} check(s) total",
        config.check_groups.len()
    );
    Ok(config)
}

fn parse_llm(section: Option<&toml::Value>) -> Result<LlmSettings> {
    let table = section
        .and_then(|v| v.as_table())
        .ok_or_else(|| invalid("Missing required [llm] section".to_string()))?;

    for key in table.keys() {
        if !LLM_KEYS.contains(&key.as_str()) {
            return Err(invalid(format!(
                "Unknown key '{key}' under [llm]. Accepted keys: {}",
                LLM_KEYS.join(", ")
            )));
        }
    }

    let backend_raw = require_str(table, "backend", "[llm]")?;
    let backend = match backend_raw.as_str() {
        "openai-compatible" => BackendKind::OpenAiCompatible,
        "native-chat" => BackendKind::NativeChat,
        other => {
            return Err(invalid(format!(
                "Invalid backend '{other}'. Must be one of: openai-compatible, native-chat"
            )))
        }
    };

    let host = require_str(table, "host", "[llm]")?;
    let port = require_int(table, "port", "[llm]")?;
    let port = u16::try_from(port).map_err(|_| invalid(format!("[llm] port {port} out of range")))?;

    let model = match table.get("model") {
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| invalid("[llm] model must be a string".to_string()))?
                .to_string(),
        ),
        None => None,
    };
    if backend == BackendKind::NativeChat && model.is_none() {
        return Err(invalid(
            "native-chat backend requires 'model' to be specified.\n\
             Example: model = \"qwen3:4b\""
                .to_string(),
        ));
    }

    let timeout = match table.get("timeout") {
        Some(v) => {
            let secs = v
                .as_integer()
                .filter(|s| *s > 0)
                .ok_or_else(|| invalid("[llm] timeout must be a positive integer".to_string()))?;
            Duration::from_secs(secs as u64)
        }
        None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    };

    let context_limit = require_int(table, "context_limit", "[llm]")?;
    if context_limit <= 0 {
        return Err(invalid("[llm] context_limit must be positive".to_string()));
    }

    Ok(LlmSettings {
        backend,
        host,
        port,
        model,
        timeout,
        context_limit: context_limit as usize,
    })
}

fn parse_checks(section: Option<&toml::Value>) -> Result<Vec<CheckGroup>> {
    let value = section.ok_or_else(|| {
        invalid("Missing 'checks': add [[checks]] groups with pattern and checks".to_string())
    })?;

    let entries = value
        .as_array()
        .ok_or_else(|| invalid("'checks' must be an array".to_string()))?;

    // Legacy shape: a flat list of prompt strings becomes one group
    // matching every file.
    if entries.iter().all(|e| e.is_str()) && !entries.is_empty() {
        let prompts = entries
            .iter()
            .map(|e| e.as_str().unwrap_or_default().trim().to_string())
            .collect::<Vec<_>>();
        if prompts.iter().any(String::is_empty) {
            return Err(invalid("Legacy 'checks' entries must be non-empty strings".to_string()));
        }
        log::warn!("Legacy top-level 'checks' list found; treating as a single group with pattern '*'");
        return Ok(vec![CheckGroup {
            pattern: "*".to_string(),
            prompts,
        }]);
    }

    let mut groups = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let table = entry.as_table().ok_or_else(|| {
            invalid(format!("[[checks]] entry {idx} must be a table with pattern and checks"))
        })?;

        for key in table.keys() {
            if !CHECK_KEYS.contains(&key.as_str()) {
                return Err(invalid(format!(
                    "Unknown key '{key}' under [[checks]]. Accepted keys: {}",
                    CHECK_KEYS.join(", ")
                )));
            }
        }

        let pattern = require_str(table, "pattern", "[[checks]]")?;
        let prompts = match table.get("checks") {
            Some(v) => {
                let list = v
                    .as_array()
                    .ok_or_else(|| invalid("[[checks]] 'checks' must be a list of strings".to_string()))?;
                let mut prompts = Vec::with_capacity(list.len());
                for (i, item) in list.iter().enumerate() {
                    let prompt = item.as_str().map(str::trim).unwrap_or_default();
                    if prompt.is_empty() {
                        return Err(invalid(format!(
                            "Check {i} in [[checks]] group {idx} must be a non-empty string"
                        )));
                    }
                    prompts.push(prompt.to_string());
                }
                prompts
            }
            None => Vec::new(),
        };

        groups.push(CheckGroup { pattern, prompts });
    }

    if groups.is_empty() {
        return Err(invalid("'checks' must contain at least one group".to_string()));
    }

    Ok(groups)
}

fn require_str(table: &toml::map::Map<String, toml::Value>, key: &str, section: &str) -> Result<String> {
    table
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid(format!("{section} requires a non-empty string '{key}'")))
}

fn require_int(table: &toml::map::Map<String, toml::Value>, key: &str, section: &str) -> Result<i64> {
    table
        .get(key)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| invalid(format!("{section} requires an integer '{key}'")))
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}
