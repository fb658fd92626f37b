//! Shared shutdown coordination (§4.9): a single `CancellationToken` every
//! long-lived task observes at its suspension points, plus a `TaskTracker`
//! so the top level can wait for bounded-timeout drain before disposing
//! database pools and broker channels last. Grounded in
//! `rayhunter-daemon`'s `main.rs`/`server.rs` shutdown wiring.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Raises the shutdown signal. Idempotent; safe to call more than once
    /// (e.g. a second SIGTERM while already draining).
    pub fn signal(&self) {
        self.token.cancel();
    }

    /// Waits for SIGINT/SIGTERM, then raises the signal.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        self.signal();
    }

    /// Closes the tracker and waits for spawned tasks to finish, capped at
    /// `timeout` (default 1.5 s per config) so a stuck task can't block
    /// process exit indefinitely.
    pub async fn drain(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            log::warn!("shutdown drain timed out after {timeout:?}; exiting with tasks still live");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_marks_token_cancelled() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_shutting_down());
        shutdown.signal();
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn drain_returns_once_tracked_tasks_finish() {
        let shutdown = Shutdown::new();
        let tracker = shutdown.tracker();
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        shutdown.drain(Duration::from_secs(1)).await;
    }
}
