use async_trait::async_trait;
use scanner_engine::{IssueTracker, ReportWriter, Scanner};
use scanner_gitwatch::{ChangeSetCell, FileFilter, WatcherState};
use scanner_llm::{LlmClient, LlmError, ToolDispatcher};
use scanner_protocol::text::sha256_hex;
use scanner_protocol::{
    BackendKind, ChangeSet, ChangedFile, CheckGroup, Config, FileChangeKind, IssueReport,
    LlmSettings, ReportedIssue,
};
use scanner_tools::{CtagsIndex, ToolExecutor};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

enum Scripted {
    Report(Vec<ReportedIssue>),
    Protocol,
}

struct ScriptedClient {
    script: Mutex<Vec<Scripted>>,
    calls: Mutex<usize>,
}

impl ScriptedClient {
    fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(0),
        }
    }

    fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<(), LlmError> {
        Ok(())
    }

    fn context_limit(&self) -> usize {
        100_000
    }

    async fn query(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _tools: Option<&dyn ToolDispatcher>,
        _max_tool_iterations: usize,
    ) -> Result<IssueReport, LlmError> {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.remove(0)
        } else {
            match script.first() {
                Some(Scripted::Report(issues)) => Scripted::Report(issues.clone()),
                Some(Scripted::Protocol) => Scripted::Protocol,
                None => Scripted::Report(Vec::new()),
            }
        };
        match next {
            Scripted::Report(issues) => Ok(IssueReport { issues }),
            Scripted::Protocol => Err(LlmError::Protocol {
                backend: "scripted",
                message: "bad json".to_string(),
            }),
        }
    }
}

fn heap_issue() -> ReportedIssue {
    ReportedIssue {
        file: "src/main.cpp".to_string(),
        line_number: 7,
        description: "Heap allocation where stack allocation would do".to_string(),
        suggested_fix: "QApplication app(argc, argv);".to_string(),
        code_snippet: "QApplication* app = new QApplication(argc, argv);".to_string(),
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        target_directory: root.to_path_buf(),
        config_file: root.join("config.toml"),
        commit_hash: None,
        check_groups: vec![CheckGroup {
            pattern: "*.cpp".to_string(),
            prompts: vec![
                "Check that stack allocation is preferred over heap allocation whenever possible."
                    .to_string(),
            ],
        }],
        llm: LlmSettings {
            backend: BackendKind::OpenAiCompatible,
            host: "localhost".to_string(),
            port: 1234,
            model: None,
            timeout: Duration::from_secs(5),
            context_limit: 100_000,
        },
        debug: false,
    }
}

fn changeset_for(root: &Path, paths: &[&str]) -> ChangeSet {
    let files = paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(root.join(path)).unwrap();
            ChangedFile {
                path: path.to_string(),
                kind: FileChangeKind::Unstaged,
                content_hash: Some(sha256_hex(&bytes)),
            }
        })
        .collect();
    ChangeSet { files }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    cell: ChangeSetCell,
    client: Arc<ScriptedClient>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

fn start_scanner(script: Vec<Scripted>) -> Option<Harness> {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(
        root.join("src/main.cpp"),
        "int main(int argc, char** argv) {\n    QApplication* app = new QApplication(argc, argv);\n}\n",
    )
    .unwrap();

    let ctags = match CtagsIndex::new(&root) {
        Ok(index) => Arc::new(index),
        Err(err) => {
            eprintln!("skipping: {err}");
            return None;
        }
    };

    let config = test_config(&root);
    let filter = Arc::new(FileFilter::new(
        &root,
        config.scanner_owned_files(),
        config.ignore_patterns(),
    ));
    let executor = Arc::new(
        ToolExecutor::new(&root, 100_000, ctags, Arc::new(AtomicBool::new(false))).unwrap(),
    );
    let client = Arc::new(ScriptedClient::new(script));
    let report = ReportWriter::new(&config.report_path(), &config.report_backup_path(), &root);
    let cell = ChangeSetCell::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scanner = Scanner::new(
        config,
        cell.clone(),
        filter,
        client.clone(),
        executor,
        IssueTracker::default(),
        report,
        shutdown_rx,
    );
    let handle = tokio::spawn(scanner.run());

    Some(Harness {
        _dir: dir,
        root,
        cell,
        client,
        shutdown_tx,
        handle,
    })
}

async fn wait_for_report(root: &Path, needle: &str) -> String {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(root.join("code_scanner_results.md")) {
            if text.contains(needle) {
                return text;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "report never contained '{needle}'. Current content:\n{}",
        std::fs::read_to_string(root.join("code_scanner_results.md")).unwrap_or_default()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heap_alloc_issue_opens_then_resolves_after_fix() {
    let Some(harness) = start_scanner(vec![
        Scripted::Report(vec![heap_issue()]),
        Scripted::Report(Vec::new()),
    ]) else {
        return;
    };

    harness.cell.publish(WatcherState::Ready(changeset_for(
        &harness.root,
        &["src/main.cpp"],
    )));

    let text = wait_for_report(&harness.root, "[OPEN] line 7").await;
    assert!(text.contains("## src/main.cpp"));
    assert!(text.contains("Heap allocation"));
    assert!(text.contains("QApplication app(argc, argv);"));

    // Apply the fix and publish the new worktree state.
    std::fs::write(
        harness.root.join("src/main.cpp"),
        "int main(int argc, char** argv) {\n    QApplication app(argc, argv);\n}\n",
    )
    .unwrap();
    harness.cell.publish(WatcherState::Ready(changeset_for(
        &harness.root,
        &["src/main.cpp"],
    )));

    let text = wait_for_report(&harness.root, "[RESOLVED] line 7").await;
    assert!(!text.contains("[OPEN]"), "{text}");

    harness.shutdown_tx.send(true).unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_check_never_resolves_existing_issues() {
    let Some(harness) = start_scanner(vec![
        Scripted::Report(vec![heap_issue()]),
        Scripted::Protocol,
    ]) else {
        return;
    };

    harness.cell.publish(WatcherState::Ready(changeset_for(
        &harness.root,
        &["src/main.cpp"],
    )));
    wait_for_report(&harness.root, "[OPEN] line 7").await;

    // Touch the file so a second cycle runs; the model then fails.
    std::fs::write(
        harness.root.join("src/main.cpp"),
        "int main(int argc, char** argv) {\n    QApplication* app = new QApplication(argc, argv);\n    return 0;\n}\n",
    )
    .unwrap();
    harness.cell.publish(WatcherState::Ready(changeset_for(
        &harness.root,
        &["src/main.cpp"],
    )));

    // Wait until the failed check has been consumed.
    for _ in 0..100 {
        if harness.client.call_count() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let text =
        std::fs::read_to_string(harness.root.join("code_scanner_results.md")).unwrap();
    assert!(text.contains("[OPEN] line 7"), "{text}");
    assert!(!text.contains("[RESOLVED]"), "{text}");

    harness.shutdown_tx.send(true).unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_file_resolves_its_issues() {
    let Some(harness) = start_scanner(vec![Scripted::Report(vec![heap_issue()])]) else {
        return;
    };

    harness.cell.publish(WatcherState::Ready(changeset_for(
        &harness.root,
        &["src/main.cpp"],
    )));
    wait_for_report(&harness.root, "[OPEN] line 7").await;

    std::fs::remove_file(harness.root.join("src/main.cpp")).unwrap();
    harness.cell.publish(WatcherState::Ready(ChangeSet {
        files: vec![ChangedFile {
            path: "src/main.cpp".to_string(),
            kind: FileChangeKind::Deleted,
            content_hash: None,
        }],
    }));

    wait_for_report(&harness.root, "[RESOLVED] line 7").await;

    harness.shutdown_tx.send(true).unwrap();
    harness.handle.await.unwrap();
}
