//! Periodic metrics reporter (§2 "Load reporter"): POSTs counters to an
//! external monitor on an interval, independent of the health endpoint.
//! Uses `reqwest`, the only HTTP client in the corpus' dependency stack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::directory::DeviceDirectory;

#[derive(Default)]
pub struct Counters {
    pub connections_accepted: AtomicU64,
    pub bytes_read: AtomicU64,
    pub records_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
}

#[derive(Serialize)]
struct MetricsPayload {
    node_id: String,
    active_connections: usize,
    connections_accepted: u64,
    bytes_read: u64,
    records_decoded: u64,
    decode_errors: u64,
}

pub struct LoadReporter {
    client: reqwest::Client,
    metrics_url: String,
    node_id: String,
    directory: DeviceDirectory,
    counters: Arc<Counters>,
}

impl LoadReporter {
    pub fn new(
        metrics_url: String,
        node_id: String,
        directory: DeviceDirectory,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            metrics_url,
            node_id,
            directory,
            counters,
        }
    }

    async fn report_once(&self) {
        let payload = MetricsPayload {
            node_id: self.node_id.clone(),
            active_connections: self.directory.active_connections().await,
            connections_accepted: self.counters.connections_accepted.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            records_decoded: self.counters.records_decoded.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        };

        if let Err(e) = self.client.post(&self.metrics_url).json(&payload).send().await {
            log::warn!("load reporter failed to post metrics: {e}");
        }
    }

    /// Runs until `token` is cancelled, posting every `interval`.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.report_once().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = Counters::default();
        assert_eq!(counters.connections_accepted.load(Ordering::Relaxed), 0);
    }
}
