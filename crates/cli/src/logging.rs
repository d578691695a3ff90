use log::{Level, Log, Metadata, Record};
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Mutex;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const BLUE: &str = "\x1b[34m";

/// Message color per level, mirrored by a separate color for the level
/// label itself.
fn message_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[91m",
        Level::Warn => "\x1b[93m",
        Level::Info => "\x1b[96m",
        Level::Debug | Level::Trace => "\x1b[90m",
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug | Level::Trace => "\x1b[90m",
    }
}

/// Colors only when stderr is a real terminal and the user has not
/// opted out. `FORCE_COLOR` overrides the terminal check.
fn supports_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    if !std::io::stderr().is_terminal() {
        return false;
    }
    std::env::var("TERM").map_or(true, |term| term != "dumb")
}

/// Logger with two sinks: colored lines on stderr when the terminal
/// supports it, plain lines in the scanner's log file. Filtering is
/// delegated to env_logger so `RUST_LOG` keeps working.
struct TeeLogger {
    filter: env_logger::Logger,
    file: Mutex<std::fs::File>,
    use_color: bool,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.filter.matches(record) {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let plain = format!(
            "{timestamp} - {} - {} - {}\n",
            record.target(),
            record.level(),
            record.args()
        );

        if self.use_color {
            let level = record.level();
            let _ = writeln!(
                std::io::stderr(),
                "{DIM}{timestamp}{RESET} - {BLUE}{}{RESET} - {}{:8}{RESET} - {}{}{RESET}",
                record.target(),
                level_color(level),
                level,
                message_color(level),
                record.args()
            );
        } else {
            let _ = std::io::stderr().write_all(plain.as_bytes());
        }

        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(plain.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Initialize logging to stderr plus the scanner's log file. The file
/// starts fresh each session and always gets the plain format.
pub fn init(log_path: &Path, debug: bool) -> std::io::Result<()> {
    let file = std::fs::File::create(log_path)?;
    let default_level = if debug { "debug" } else { "info" };

    let filter = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .build();

    let max_level = filter.filter();
    let logger = TeeLogger {
        filter,
        file: Mutex::new(file),
        use_color: supports_color(),
    };

    log::set_boxed_logger(Box::new(logger))
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    log::set_max_level(max_level);
    Ok(())
}
