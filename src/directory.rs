//! Process-wide device directory (§4.7, §5): `(ip,port) → ConnectionState`
//! with a secondary index by IMEI, so the command correlator can resolve an
//! active connection without the connection handlers knowing about it.
//! Guarded by a single `tokio::sync::RwLock`, matching the read-mostly
//! sharing pattern the mapping cache also uses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

/// Commands the correlator hands to a connection's write side. The writer
/// half lives inside the connection task, so delivery is via a channel
/// rather than a shared socket handle.
pub type WriterHandle = mpsc::Sender<Vec<u8>>;

#[derive(Clone)]
pub struct ConnectionState {
    pub remote_addr: SocketAddr,
    pub imei: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub writer: WriterHandle,
}

#[derive(Default)]
struct DirectoryState {
    by_addr: HashMap<SocketAddr, ConnectionState>,
    by_imei: HashMap<String, SocketAddr>,
}

#[derive(Clone)]
pub struct DeviceDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(DirectoryState::default())),
        }
    }

    pub async fn register(&self, addr: SocketAddr, writer: WriterHandle) {
        let mut state = self.state.write().await;
        state.by_addr.insert(
            addr,
            ConnectionState {
                remote_addr: addr,
                imei: None,
                last_activity: Utc::now(),
                writer,
            },
        );
    }

    /// Records the IMEI once login framing validates (§4.7 AUTHENTICATING →
    /// READY), indexing it for lookup by the command correlator.
    pub async fn set_imei(&self, addr: SocketAddr, imei: String) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.by_addr.get_mut(&addr) {
            entry.imei = Some(imei.clone());
        }
        state.by_imei.insert(imei, addr);
    }

    pub async fn touch(&self, addr: SocketAddr) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.by_addr.get_mut(&addr) {
            entry.last_activity = Utc::now();
        }
    }

    pub async fn unregister(&self, addr: SocketAddr) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.by_addr.remove(&addr) {
            if let Some(imei) = entry.imei {
                state.by_imei.remove(&imei);
            }
        }
    }

    pub async fn writer_for_imei(&self, imei: &str) -> Option<WriterHandle> {
        let state = self.state.read().await;
        let addr = state.by_imei.get(imei)?;
        state.by_addr.get(addr).map(|e| e.writer.clone())
    }

    pub async fn active_connections(&self) -> usize {
        self.state.read().await.by_addr.len()
    }
}

impl Default for DeviceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn registers_and_resolves_writer_by_imei() {
        let dir = DeviceDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        dir.register(addr(1), tx).await;
        dir.set_imei(addr(1), "123456789012345".into()).await;

        assert!(dir.writer_for_imei("123456789012345").await.is_some());
        assert_eq!(dir.active_connections().await, 1);
    }

    #[tokio::test]
    async fn unregister_clears_both_indexes() {
        let dir = DeviceDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        dir.register(addr(2), tx).await;
        dir.set_imei(addr(2), "999999999999999".into()).await;
        dir.unregister(addr(2)).await;

        assert!(dir.writer_for_imei("999999999999999").await.is_none());
        assert_eq!(dir.active_connections().await, 0);
    }
}
