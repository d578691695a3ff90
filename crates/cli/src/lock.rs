use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error(
        "Another code-scanner instance is already running (PID: {pid}).\n\
         Lock file: {path}\n\
         Wait for it to finish or terminate it manually."
    )]
    Held { pid: u32, path: String },

    #[error("Could not create lock file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Per-user PID lock file.
///
/// Release is idempotent and safe from any exit path: the owned flag
/// flips exactly once, whether via the signal task, normal shutdown,
/// or the Drop guard on a crash.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    owned: Arc<AtomicBool>,
}

impl LockFile {
    /// Acquire the lock, reclaiming it if the recorded PID is dead or
    /// the contents are garbage.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if path.exists() {
            match std::fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok())
            {
                Some(pid) if process_alive(pid) => {
                    return Err(LockError::Held {
                        pid,
                        path: path.display().to_string(),
                    })
                }
                Some(pid) => {
                    std::fs::remove_file(path)?;
                    log::info!("Removed stale lock file (PID {pid} no longer running)");
                }
                None => {
                    std::fs::remove_file(path)?;
                    log::warn!("Removed invalid lock file: {}", path.display());
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        log::debug!("Acquired lock: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            owned: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&self) {
        if self.owned.swap(false, Ordering::SeqCst) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not remove lock file: {err}");
                }
            } else {
                log::debug!("Released lock: {}", self.path.display());
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence; EPERM still means alive.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code_scanner.lock");
        let lock = LockFile::acquire(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code_scanner.lock");
        // Our own PID is definitely alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = LockFile::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code_scanner.lock");
        // PIDs near the max are essentially never live in tests.
        std::fs::write(&path, "4194303\n").unwrap();

        let lock = LockFile::acquire(&path).unwrap();
        lock.release();
    }

    #[test]
    fn garbage_contents_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code_scanner.lock");
        std::fs::write(&path, "not a pid").unwrap();

        let lock = LockFile::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code_scanner.lock");
        let lock = LockFile::acquire(&path).unwrap();
        lock.release();
        lock.release();
        assert!(!path.exists());
    }
}
