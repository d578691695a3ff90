use crate::lock::LockFile;
use anyhow::{Context, Result};
use scanner_engine::{IssueTracker, ReportWriter, Scanner};
use scanner_gitwatch::{ChangeSetCell, FileFilter, GitWatcher};
use scanner_llm::{create_client, LlmClient};
use scanner_protocol::Config;
use scanner_tools::{verify_ripgrep, CtagsIndex, ToolExecutor};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Startup validation in order: lock, report rotation, Git repository,
/// LLM backend (with context-limit validation), tool binaries, initial
/// report, then the watcher and scanner tasks. Any failure here is a
/// runtime-fatal exit; the lock is released on every path.
pub async fn run(config: Config) -> Result<()> {
    let lock = LockFile::acquire(&config.lock_path())?;
    let result = run_locked(&config).await;
    lock.release();
    result
}

async fn run_locked(config: &Config) -> Result<()> {
    let total_checks: usize = config.check_groups.iter().map(|g| g.prompts.len()).sum();
    log::info!(
        "{}\nCode Scanner starting\nTarget directory: {}\nConfig file: {}\nReport file: {}\nCheck groups: {}, total checks: {}\n{}",
        "=".repeat(60),
        config.target_directory.display(),
        config.config_file.display(),
        config.report_path().display(),
        config.check_groups.len(),
        total_checks,
        "=".repeat(60),
    );

    let report = ReportWriter::new(
        &config.report_path(),
        &config.report_backup_path(),
        &config.target_directory,
    );
    report
        .rotate_existing()
        .context("Could not rotate the existing report")?;

    let filter = Arc::new(FileFilter::new(
        &config.target_directory,
        config.scanner_owned_files(),
        config.ignore_patterns(),
    ));

    let watcher = GitWatcher::connect(
        &config.target_directory,
        config.commit_hash.clone(),
        filter.clone(),
    )
    .await?;

    let client: Arc<dyn LlmClient> = Arc::from(create_client(&config.llm));
    client.connect().await?;
    log::info!("Connected to {} backend", client.backend_name());

    let ctags = Arc::new(CtagsIndex::new(&config.target_directory)?);
    verify_ripgrep()?;

    let tool_shutdown = Arc::new(AtomicBool::new(false));
    let executor = Arc::new(ToolExecutor::new(
        &config.target_directory,
        client.context_limit(),
        ctags,
        tool_shutdown.clone(),
    )?);

    // An empty report up front tells the user the daemon is alive.
    report
        .write(&BTreeMap::new(), "Scanning in progress...")
        .context("Could not create the initial report")?;
    log::info!("Created initial report: {}", config.report_path().display());

    let cell = ChangeSetCell::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher_handle = tokio::spawn(watcher.run(
        cell.clone(),
        config.git_poll_interval(),
        shutdown_rx.clone(),
    ));
    let scanner = Scanner::new(
        config.clone(),
        cell,
        filter,
        client,
        executor,
        IssueTracker::default(),
        report,
        shutdown_rx,
    );
    let scanner_handle = tokio::spawn(scanner.run());

    log::info!("Scanner running. Press Ctrl+C to stop.");
    wait_for_signal().await;
    log::info!("Received termination signal, stopping...");

    tool_shutdown.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("watcher", watcher_handle), ("scanner", scanner_handle)] {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("{name} task ended abnormally: {err}"),
            Err(_) => log::warn!("{name} task did not stop within {SHUTDOWN_GRACE:?}"),
        }
    }

    log::info!("Cleanup complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
