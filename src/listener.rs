//! TCP accept loop (§4.7 Admission, §5): bounded concurrent connections
//! guarded by an exclusion primitive around the counter, rejecting new
//! connections once `max_concurrent_connections` is reached within
//! `connection_reject_timeout`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::connection::{handle_connection, ConnectionDeps};

pub struct ListenerConfig {
    pub bind_addr: String,
    pub max_concurrent_connections: usize,
    pub connection_reject_timeout: Duration,
}

pub struct Listener {
    config: ListenerConfig,
    active: Arc<AtomicUsize>,
}

impl Listener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs until `deps.shutdown` is cancelled, spawning one task per
    /// accepted connection via the tracker so shutdown can drain them.
    pub async fn run(
        &self,
        deps: ConnectionDeps,
        tracker: tokio_util::task::TaskTracker,
    ) -> crate::error::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("listening on {}", self.config.bind_addr);

        loop {
            tokio::select! {
                _ = deps.shutdown.cancelled() => {
                    log::info!("listener stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;

                    if self.active.load(Ordering::SeqCst) >= self.config.max_concurrent_connections {
                        log::warn!("rejecting connection from {addr}: at capacity");
                        let _ = tokio::time::timeout(
                            self.config.connection_reject_timeout,
                            async { drop(stream); },
                        ).await;
                        continue;
                    }

                    self.active.fetch_add(1, Ordering::SeqCst);
                    deps.counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    let active = self.active.clone();
                    let conn_deps = deps.clone();

                    tracker.spawn(async move {
                        handle_connection(stream, addr, conn_deps).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_zero_active_connections() {
        let listener = Listener::new(ListenerConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_concurrent_connections: 1,
            connection_reject_timeout: Duration::from_secs(1),
        });
        assert_eq!(listener.active.load(Ordering::SeqCst), 0);
    }
}
