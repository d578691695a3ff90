use clap::Parser;
use scanner_protocol::load_config;
use std::path::PathBuf;
use std::process::ExitCode;

mod lock;
mod logging;
mod supervisor;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "code-scanner")]
#[command(about = "AI-driven scanner for uncommitted changes in a Git worktree", long_about = None)]
#[command(version)]
struct Cli {
    /// Target directory to scan (must be a Git repository)
    target_directory: PathBuf,

    /// Path to the configuration file (default: config.toml next to the
    /// scanner binary)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Git commit hash to compare against (default: HEAD)
    #[arg(long)]
    commit: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    let config = match load_config(&cli.target_directory, &config_path, cli.commit, cli.debug) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(err) = logging::init(&config.log_path(), config.debug) {
        eprintln!("Could not open log file {}: {err}", config.log_path().display());
        return ExitCode::from(EXIT_RUNTIME_FATAL);
    }
    println!("Log file: {}", config.log_path().display());
    println!("Lock file: {}", config.lock_path().display());

    match supervisor::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::from(EXIT_RUNTIME_FATAL)
        }
    }
}
