use scanner_protocol::ChangeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What the watcher last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    /// Nothing published yet (before the first poll completes).
    Starting,
    /// Merge or rebase in progress; no ChangeSet is emitted.
    Wait,
    /// Current set of uncommitted, non-excluded paths.
    Ready(ChangeSet),
}

struct CellInner {
    state: Mutex<(u64, WatcherState)>,
    notify: Notify,
}

/// Single-slot shared cell with latest-wins semantics.
///
/// The watcher overwrites, the scanner reads; older publications are
/// coalesced away. The sequence number lets the scanner wait for a
/// publication newer than the one it last consumed without a queue.
#[derive(Clone)]
pub struct ChangeSetCell {
    inner: Arc<CellInner>,
}

impl ChangeSetCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CellInner {
                state: Mutex::new((0, WatcherState::Starting)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn publish(&self, state: WatcherState) {
        {
            let mut guard = self.inner.state.lock().expect("cell poisoned");
            guard.0 += 1;
            guard.1 = state;
        }
        self.inner.notify.notify_waiters();
    }

    pub fn latest(&self) -> (u64, WatcherState) {
        self.inner.state.lock().expect("cell poisoned").clone()
    }

    /// Wait until a publication newer than `seen_seq` exists, then
    /// return it. Returns immediately if one is already there.
    pub async fn wait_newer(&self, seen_seq: u64) -> (u64, WatcherState) {
        loop {
            let notified = self.inner.notify.notified();
            {
                let guard = self.inner.state.lock().expect("cell poisoned");
                if guard.0 > seen_seq {
                    return guard.clone();
                }
            }
            notified.await;
        }
    }
}

impl Default for ChangeSetCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanner_protocol::{ChangedFile, FileChangeKind};

    fn set_of(path: &str) -> ChangeSet {
        ChangeSet {
            files: vec![ChangedFile {
                path: path.to_string(),
                kind: FileChangeKind::Unstaged,
                content_hash: Some("h".to_string()),
            }],
        }
    }

    #[test]
    fn latest_wins_over_older_publications() {
        let cell = ChangeSetCell::new();
        cell.publish(WatcherState::Ready(set_of("a.rs")));
        cell.publish(WatcherState::Ready(set_of("b.rs")));

        let (seq, state) = cell.latest();
        assert_eq!(seq, 2);
        assert_eq!(state, WatcherState::Ready(set_of("b.rs")));
    }

    #[tokio::test]
    async fn wait_newer_returns_immediately_when_already_newer() {
        let cell = ChangeSetCell::new();
        cell.publish(WatcherState::Wait);
        let (seq, state) = cell.wait_newer(0).await;
        assert_eq!(seq, 1);
        assert_eq!(state, WatcherState::Wait);
    }

    #[tokio::test]
    async fn wait_newer_observes_concurrent_publish() {
        let cell = ChangeSetCell::new();
        let waiter = cell.clone();
        let handle = tokio::spawn(async move { waiter.wait_newer(0).await });
        tokio::task::yield_now().await;
        cell.publish(WatcherState::Ready(ChangeSet::default()));
        let (seq, _) = handle.await.unwrap();
        assert_eq!(seq, 1);
    }
}
