//! Minimal health endpoint (§4.9): the only HTTP surface in the crate,
//! `GET /healthz` → `{status, uptime_s, active_connections, broker_connected}`,
//! `503` once the broker has been disconnected longer than a configured
//! grace period.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::directory::DeviceDirectory;

/// Shared health state, updated by the broker publisher and read by the
/// `/healthz` handler. `broker_disconnected_since` is `None` while
/// connected; set once on disconnect and cleared on reconnect.
pub struct HealthState {
    started_at: chrono::DateTime<Utc>,
    broker_connected: AtomicBool,
    broker_disconnected_since: AtomicI64,
    broker_grace: Duration,
    directory: DeviceDirectory,
}

impl HealthState {
    pub fn new(directory: DeviceDirectory, broker_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            started_at: Utc::now(),
            broker_connected: AtomicBool::new(true),
            broker_disconnected_since: AtomicI64::new(0),
            broker_grace,
            directory,
        })
    }

    pub fn set_broker_connected(&self, connected: bool) {
        let was_connected = self.broker_connected.swap(connected, Ordering::SeqCst);
        if !connected && was_connected {
            self.broker_disconnected_since
                .store(Utc::now().timestamp(), Ordering::SeqCst);
        }
    }

    fn past_grace(&self) -> bool {
        if self.broker_connected.load(Ordering::SeqCst) {
            return false;
        }
        let since = self.broker_disconnected_since.load(Ordering::SeqCst);
        if since == 0 {
            return false;
        }
        Utc::now().timestamp() - since > self.broker_grace.as_secs() as i64
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_s: i64,
    active_connections: usize,
    broker_connected: bool,
}

async fn healthz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let broker_connected = state.broker_connected.load(Ordering::SeqCst);
    let body = HealthBody {
        status: if broker_connected { "ok" } else { "degraded" },
        uptime_s: (Utc::now() - state.started_at).num_seconds(),
        active_connections: state.directory.active_connections().await,
        broker_connected,
    };

    let code = if state.past_grace() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (code, Json(body))
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_connected_immediately_after_construction() {
        let state = HealthState::new(DeviceDirectory::new(), Duration::from_secs(30));
        assert!(!state.past_grace());
    }

    #[tokio::test]
    async fn past_grace_only_after_disconnect_grace_elapses() {
        let state = HealthState::new(DeviceDirectory::new(), Duration::from_secs(0));
        state.set_broker_connected(false);
        assert!(state.past_grace());
    }

    #[tokio::test]
    async fn reconnect_clears_degraded_status() {
        let state = HealthState::new(DeviceDirectory::new(), Duration::from_secs(0));
        state.set_broker_connected(false);
        state.set_broker_connected(true);
        assert!(!state.past_grace());
    }
}
