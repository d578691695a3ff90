use scanner_gitwatch::{ChangeSetCell, FileFilter, GitWatcher, WatcherState};
use scanner_protocol::FileChangeKind;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn git(repo: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo() -> TempDir {
    let temp = TempDir::new().expect("tempdir");
    git(temp.path(), &["init", "-q"]);
    std::fs::write(temp.path().join("tracked.rs"), "fn main() {}\n").unwrap();
    git(temp.path(), &["add", "."]);
    git(temp.path(), &["commit", "-q", "-m", "initial"]);
    temp
}

fn plain_filter(root: &Path) -> Arc<FileFilter> {
    Arc::new(FileFilter::new(
        root,
        vec![
            "code_scanner_results.md".to_string(),
            "code_scanner.log".to_string(),
        ],
        Vec::new(),
    ))
}

#[tokio::test]
async fn clean_worktree_publishes_empty_changeset() {
    let repo = init_repo();
    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");

    match watcher.poll().await.expect("poll") {
        WatcherState::Ready(set) => assert!(set.is_empty()),
        other => panic!("unexpected state: {other:?}"),
    }
}

#[tokio::test]
async fn modified_and_untracked_files_are_reported_with_hashes() {
    let repo = init_repo();
    std::fs::write(repo.path().join("tracked.rs"), "fn main() { panic!() }\n").unwrap();
    std::fs::write(repo.path().join("brand_new.rs"), "pub fn new() {}\n").unwrap();

    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");
    let WatcherState::Ready(set) = watcher.poll().await.expect("poll") else {
        panic!("expected Ready");
    };

    let tracked = set.files.iter().find(|f| f.path == "tracked.rs").unwrap();
    assert_eq!(tracked.kind, FileChangeKind::Unstaged);
    assert!(tracked.content_hash.is_some());

    let untracked = set.files.iter().find(|f| f.path == "brand_new.rs").unwrap();
    assert_eq!(untracked.kind, FileChangeKind::Untracked);
}

#[tokio::test]
async fn deleted_file_has_no_hash() {
    let repo = init_repo();
    std::fs::remove_file(repo.path().join("tracked.rs")).unwrap();

    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");
    let WatcherState::Ready(set) = watcher.poll().await.expect("poll") else {
        panic!("expected Ready");
    };

    let deleted = set.files.iter().find(|f| f.path == "tracked.rs").unwrap();
    assert_eq!(deleted.kind, FileChangeKind::Deleted);
    assert!(deleted.content_hash.is_none());
}

#[tokio::test]
async fn scanner_owned_files_never_enter_the_changeset() {
    let repo = init_repo();
    std::fs::write(repo.path().join("code_scanner_results.md"), "# report\n").unwrap();
    std::fs::write(repo.path().join("code_scanner.log"), "log line\n").unwrap();

    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");
    let WatcherState::Ready(set) = watcher.poll().await.expect("poll") else {
        panic!("expected Ready");
    };
    assert!(set.is_empty(), "got: {:?}", set.files);
}

#[tokio::test]
async fn ignore_group_patterns_drop_matching_paths() {
    let repo = init_repo();
    std::fs::create_dir_all(repo.path().join("docs")).unwrap();
    std::fs::create_dir_all(repo.path().join("build")).unwrap();
    std::fs::write(repo.path().join("docs/readme.md"), "# doc\n").unwrap();
    std::fs::write(repo.path().join("build/x.cpp"), "int x;\n").unwrap();
    std::fs::write(repo.path().join("kept.cpp"), "int y;\n").unwrap();

    let filter = Arc::new(FileFilter::new(
        repo.path(),
        Vec::new(),
        vec!["*.md".to_string(), "/*build*/".to_string()],
    ));
    let watcher = GitWatcher::connect(repo.path(), None, filter)
        .await
        .expect("connect");
    let WatcherState::Ready(set) = watcher.poll().await.expect("poll") else {
        panic!("expected Ready");
    };

    let paths: Vec<&str> = set.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["kept.cpp"]);
}

#[tokio::test]
async fn merge_in_progress_publishes_wait() {
    let repo = init_repo();
    let git_dir = repo.path().join(".git");
    std::fs::write(git_dir.join("MERGE_HEAD"), "deadbeef\n").unwrap();

    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");
    assert_eq!(watcher.poll().await.expect("poll"), WatcherState::Wait);
}

#[tokio::test]
async fn base_commit_mode_includes_committed_changes_and_untracked() {
    let repo = init_repo();
    let base = {
        let out = std::process::Command::new("git")
            .arg("-C")
            .arg(repo.path())
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    };

    std::fs::write(repo.path().join("committed_later.rs"), "pub fn later() {}\n").unwrap();
    git(repo.path(), &["add", "committed_later.rs"]);
    git(repo.path(), &["commit", "-q", "-m", "second"]);
    std::fs::write(repo.path().join("floating.rs"), "pub fn floating() {}\n").unwrap();

    let watcher = GitWatcher::connect(repo.path(), Some(base), plain_filter(repo.path()))
        .await
        .expect("connect");
    let WatcherState::Ready(set) = watcher.poll().await.expect("poll") else {
        panic!("expected Ready");
    };

    assert!(set.contains("committed_later.rs"));
    assert!(set.contains("floating.rs"));
}

#[tokio::test]
async fn invalid_base_commit_is_rejected() {
    let repo = init_repo();
    let result = GitWatcher::connect(
        repo.path(),
        Some("0000000000000000000000000000000000000000".to_string()),
        plain_filter(repo.path()),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn non_repository_is_rejected() {
    let temp = TempDir::new().unwrap();
    let result = GitWatcher::connect(temp.path(), None, plain_filter(temp.path())).await;
    assert!(matches!(
        result,
        Err(scanner_gitwatch::GitError::NotARepository(_))
    ));
}

#[tokio::test]
async fn run_loop_publishes_initial_state_then_stops() {
    let repo = init_repo();
    let watcher = GitWatcher::connect(repo.path(), None, plain_filter(repo.path()))
        .await
        .expect("connect");

    let cell = ChangeSetCell::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(watcher.run(
        cell.clone(),
        std::time::Duration::from_secs(30),
        shutdown_rx,
    ));

    let (seq, state) = cell.wait_newer(0).await;
    assert_eq!(seq, 1);
    assert!(matches!(state, WatcherState::Ready(_)));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
