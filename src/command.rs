//! Codec 12 command correlator (§4.8): outbox poller, sender, response
//! handler, and no-reply sweeper, sharing the `command_outbox` /
//! `command_sent` / `command_history` tables with the (out-of-scope) ops
//! service and SMS gateway. Grounded in the broker's own publish/confirm
//! pattern for the sender's framing, and in `config.rs`'s table shapes
//! (SPEC_FULL §4.8).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::codec::crc16;
use crate::directory::DeviceDirectory;
use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub imei: String,
    pub sim_no: String,
    pub command_text: String,
    pub config_id: Option<i64>,
    pub user_id: Option<i64>,
    pub send_method: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SentRow {
    pub id: i64,
    pub outbox_id: i64,
    pub imei: String,
    pub status: String,
    pub response_text: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Backing store for the correlator's tables. A trait so tests can swap in
/// an in-memory double without a live Postgres instance.
#[async_trait::async_trait]
pub trait CommandStore: Send + Sync {
    /// `command_outbox` rows with `send_method='gprs'`, ordered by `id` so
    /// per-IMEI ordering (§5) falls out of iteration order.
    async fn pending_gprs(&self) -> Result<Vec<OutboxRow>>;
    async fn record_sent(&self, outbox_id: i64, imei: &str) -> Result<()>;
    /// Most recent `command_sent` row for `imei` still in `status='sent'`.
    async fn latest_sent(&self, imei: &str) -> Result<Option<SentRow>>;
    async fn mark_result(&self, sent_id: i64, status: &str, response_text: Option<&str>) -> Result<()>;
    async fn record_unsolicited(&self, imei: &str, response_text: &str) -> Result<()>;
    /// Marks rows still `status='sent'` older than `older_than` as
    /// `no_reply`; returns the count affected. Idempotent.
    async fn sweep_no_reply(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CommandStore for PgCommandStore {
    async fn pending_gprs(&self) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as(
            "SELECT o.id, o.imei, o.sim_no, o.command_text, o.config_id, o.user_id, \
             o.send_method, o.retry_count, o.created_at \
             FROM command_outbox o \
             WHERE o.send_method = 'gprs' \
               AND NOT EXISTS (SELECT 1 FROM command_sent s WHERE s.outbox_id = o.id) \
             ORDER BY o.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_sent(&self, outbox_id: i64, imei: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_sent (outbox_id, imei, status, sent_at, created_at) \
             VALUES ($1, $2, 'sent', now(), now())",
        )
        .bind(outbox_id)
        .bind(imei)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_sent(&self, imei: &str) -> Result<Option<SentRow>> {
        let row = sqlx::query_as(
            "SELECT id, outbox_id, imei, status, response_text, error_message, sent_at, created_at \
             FROM command_sent \
             WHERE imei = $1 AND status = 'sent' \
             ORDER BY sent_at DESC LIMIT 1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_result(&self, sent_id: i64, status: &str, response_text: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE command_sent SET status = $2, response_text = $3 WHERE id = $1",
        )
        .bind(sent_id)
        .bind(status)
        .bind(response_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_unsolicited(&self, imei: &str, response_text: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_history (imei, direction, response_text, created_at) \
             VALUES ($1, 'incoming', $2, now())",
        )
        .bind(imei)
        .bind(response_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_no_reply(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE command_sent SET status = 'no_reply' WHERE status = 'sent' AND sent_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

const COMMAND_TYPE: u8 = 0x05;

/// Serializes a Codec 12 command frame exactly as the connection handler's
/// frame splitter expects to later re-parse a response: preamble, length,
/// `0x0C`, quantity=1, type, length-prefixed ASCII text, quantity=1, CRC.
pub fn encode_command_frame(text: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(0x0C);
    payload.push(1);
    payload.push(COMMAND_TYPE);
    payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload.push(1);

    let mut frame = Vec::new();
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    let crc = crc16(&payload) as u32;
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Polls `command_outbox` for `gprs` rows with no live connection, and sends
/// them through the directory's writer handle when one exists.
pub struct CommandSender<S: CommandStore> {
    store: S,
    directory: DeviceDirectory,
}

impl<S: CommandStore> CommandSender<S> {
    pub fn new(store: S, directory: DeviceDirectory) -> Self {
        Self { store, directory }
    }

    /// Runs one poll pass, sending every pending row with an active
    /// connection. Rows with no active connection are left pending for a
    /// later pass (§4.8).
    pub async fn poll_once(&self) -> Result<usize> {
        let mut sent = 0;
        for row in self.store.pending_gprs().await? {
            let Some(writer) = self.directory.writer_for_imei(&row.imei).await else {
                continue;
            };
            let frame = encode_command_frame(&row.command_text);
            if writer.send(frame).await.is_err() {
                log::warn!("writer channel closed for imei {} mid-send", row.imei);
                continue;
            }
            self.store.record_sent(row.id, &row.imei).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Grace window (§4.8) within which a Codec 12 response is matched to the
/// most recent `sent` row for that IMEI rather than treated as unsolicited.
pub struct ResponseHandler<S: CommandStore> {
    store: S,
    grace: chrono::Duration,
}

impl<S: CommandStore> ResponseHandler<S> {
    pub fn new(store: S, grace: chrono::Duration) -> Self {
        Self { store, grace }
    }

    /// Invoked by the connection handler on decoding a Codec 12 response
    /// (§4.7). Never emits a data ACK — that's the connection handler's call.
    pub async fn handle_response(&self, imei: &str, response_text: &str) -> Result<()> {
        match self.store.latest_sent(imei).await? {
            Some(sent) if Utc::now() - sent.sent_at <= self.grace => {
                self.store
                    .mark_result(sent.id, "successful", Some(response_text))
                    .await?;
            }
            _ => {
                self.store.record_unsolicited(imei, response_text).await?;
            }
        }
        Ok(())
    }
}

/// Object-safe facade over [`ResponseHandler`] so the connection handler
/// can hold one without naming the concrete `CommandStore` type.
#[async_trait::async_trait]
pub trait CommandResponseSink: Send + Sync {
    async fn handle_response(&self, imei: &str, response_text: &str) -> Result<()>;
}

#[async_trait::async_trait]
impl<S: CommandStore> CommandResponseSink for ResponseHandler<S> {
    async fn handle_response(&self, imei: &str, response_text: &str) -> Result<()> {
        ResponseHandler::handle_response(self, imei, response_text).await
    }
}

pub struct NoReplySweeper<S: CommandStore> {
    store: S,
    threshold: chrono::Duration,
}

impl<S: CommandStore> NoReplySweeper<S> {
    pub fn new(store: S, threshold: chrono::Duration) -> Self {
        Self { store, threshold }
    }

    pub async fn sweep(&self) -> Result<u64> {
        self.store.sweep_no_reply(Utc::now() - self.threshold).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FixedStore {
        outbox: Mutex<Vec<OutboxRow>>,
        sent: Mutex<Vec<SentRow>>,
        unsolicited: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl CommandStore for FixedStore {
        async fn pending_gprs(&self) -> Result<Vec<OutboxRow>> {
            Ok(self.outbox.lock().unwrap().clone())
        }
        async fn record_sent(&self, outbox_id: i64, imei: &str) -> Result<()> {
            self.sent.lock().unwrap().push(SentRow {
                id: outbox_id,
                outbox_id,
                imei: imei.to_string(),
                status: "sent".into(),
                response_text: None,
                error_message: None,
                sent_at: Utc::now(),
                created_at: Utc::now(),
            });
            Ok(())
        }
        async fn latest_sent(&self, imei: &str) -> Result<Option<SentRow>> {
            Ok(self
                .sent
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|s| s.imei == imei && s.status == "sent")
                .cloned())
        }
        async fn mark_result(&self, sent_id: i64, status: &str, response_text: Option<&str>) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if let Some(row) = sent.iter_mut().find(|s| s.id == sent_id) {
                row.status = status.to_string();
                row.response_text = response_text.map(String::from);
            }
            Ok(())
        }
        async fn record_unsolicited(&self, imei: &str, response_text: &str) -> Result<()> {
            self.unsolicited
                .lock()
                .unwrap()
                .push((imei.to_string(), response_text.to_string()));
            Ok(())
        }
        async fn sweep_no_reply(&self, older_than: DateTime<Utc>) -> Result<u64> {
            let mut sent = self.sent.lock().unwrap();
            let mut count = 0;
            for row in sent.iter_mut() {
                if row.status == "sent" && row.sent_at < older_than {
                    row.status = "no_reply".into();
                    count += 1;
                }
            }
            Ok(count)
        }
    }

    fn outbox_row(id: i64, imei: &str) -> OutboxRow {
        OutboxRow {
            id,
            imei: imei.to_string(),
            sim_no: "1234".into(),
            command_text: "getinfo".into(),
            config_id: None,
            user_id: None,
            send_method: "gprs".into(),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn encoded_command_frame_round_trips_through_the_codec() {
        let frame = encode_command_frame("getinfo");
        let length = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
        let payload = &frame[8..8 + length];
        let (_, decoded) = crate::codec::codec12::decode(&payload[1..]).unwrap();
        assert_eq!(decoded.text, "getinfo");
    }

    #[tokio::test]
    async fn poller_skips_rows_with_no_active_connection() {
        let store = FixedStore::default();
        store.outbox.lock().unwrap().push(outbox_row(1, "123456789012345"));
        let directory = DeviceDirectory::new();
        let sender = CommandSender::new(store, directory);
        assert_eq!(sender.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poller_sends_and_records_when_connection_exists() {
        let store = FixedStore::default();
        store.outbox.lock().unwrap().push(outbox_row(1, "123456789012345"));
        let directory = DeviceDirectory::new();
        let (tx, mut rx) = mpsc::channel(1);
        directory.register("127.0.0.1:1".parse().unwrap(), tx).await;
        directory
            .set_imei("127.0.0.1:1".parse().unwrap(), "123456789012345".into())
            .await;

        let sent_marker = std::sync::Arc::new(());
        let _ = sent_marker;
        let sender = CommandSender::new(store, directory);
        assert_eq!(sender.poll_once().await.unwrap(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn response_within_grace_matches_sent_row() {
        let store = FixedStore::default();
        store.record_sent(1, "123456789012345").await.unwrap();
        let handler = ResponseHandler::new(store, chrono::Duration::seconds(60));
        handler.handle_response("123456789012345", "ok").await.unwrap();
        let sent = handler.store.latest_sent("123456789012345").await.unwrap();
        assert!(sent.is_none(), "row should have moved out of 'sent' status");
    }

    #[tokio::test]
    async fn unmatched_response_is_recorded_as_unsolicited() {
        let store = FixedStore::default();
        let handler = ResponseHandler::new(store, chrono::Duration::seconds(60));
        handler.handle_response("000000000000000", "hello").await.unwrap();
        assert_eq!(handler.store.unsolicited.lock().unwrap().len(), 1);
    }
}
