use scanner_llm::ToolDispatcher;
use scanner_tools::{CtagsIndex, ToolExecutor};
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

fn fixture_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/app.py"),
        "class Greeter:\n    def greet(self):\n        return 'hi'\n\n\ndef main():\n    Greeter().greet()\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("README.txt"), "greet the user\n").unwrap();
    dir
}

fn executor_for(dir: &TempDir) -> Option<ToolExecutor> {
    let ctags = match CtagsIndex::new(dir.path()) {
        Ok(index) => Arc::new(index),
        Err(err) => {
            eprintln!("skipping: {err}");
            return None;
        }
    };
    Some(
        ToolExecutor::new(
            dir.path(),
            100_000,
            ctags,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn path_escape_returns_structured_error() {
    let dir = fixture_repo();
    let Some(executor) = executor_for(&dir) else { return };

    let result = executor
        .execute("read_file", json!({"file_path": "../../etc/passwd"}))
        .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["kind"], "path_escape");
}

#[tokio::test]
async fn unknown_tool_returns_structured_error() {
    let dir = fixture_repo();
    let Some(executor) = executor_for(&dir) else { return };

    let result = executor.execute("launch_missiles", json!({})).await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"]["kind"], "unknown_tool");
}

#[tokio::test]
async fn read_file_round_trip() {
    let dir = fixture_repo();
    let Some(executor) = executor_for(&dir) else { return };

    let result = executor
        .execute("read_file", json!({"file_path": "src/app.py"}))
        .await;
    assert_eq!(result["success"], true);
    assert!(result["content"].as_str().unwrap().contains("class Greeter"));
}

#[tokio::test]
async fn missing_file_suggests_alternatives() {
    let dir = fixture_repo();
    let Some(executor) = executor_for(&dir) else { return };

    let result = executor
        .execute("read_file", json!({"file_path": "src/ap.py"}))
        .await;
    assert_eq!(result["error"]["kind"], "not_found");
}

#[tokio::test]
async fn symbol_tools_find_fixture_class() {
    let dir = fixture_repo();
    let Some(executor) = executor_for(&dir) else { return };

    let exists = executor
        .execute("symbol_exists", json!({"symbol": "Greeter"}))
        .await;
    if exists["success"] == true {
        assert_eq!(exists["exists"], true);
        let location = &exists["locations"][0];
        assert_eq!(location["file"], "src/app.py");
    }

    let summary = executor
        .execute("get_file_summary", json!({"file_path": "src/app.py"}))
        .await;
    if summary["success"] == true {
        let classes = summary["classes"].as_array().unwrap();
        assert!(classes.iter().any(|c| c["name"] == "Greeter"));
    }
}

#[tokio::test]
async fn shutdown_flag_blocks_execution() {
    let dir = fixture_repo();
    let ctags = match CtagsIndex::new(dir.path()) {
        Ok(index) => Arc::new(index),
        Err(_) => return,
    };
    let shutdown = Arc::new(AtomicBool::new(true));
    let executor = ToolExecutor::new(dir.path(), 100_000, ctags, shutdown).unwrap();

    let result = executor
        .execute("read_file", json!({"file_path": "src/app.py"}))
        .await;
    assert_eq!(result["success"], false);
}
