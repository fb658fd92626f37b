//! Broker publisher (§4.6): topic exchange, publisher confirms, fast-fail
//! once shutdown has started. Grounded in `rabbitmq_producer.py`, adapted to
//! `lapin`'s connection/channel/confirm API since `lapin` has no
//! `connect_robust` equivalent — startup uses our own exponential-backoff
//! retry loop around `lapin::Connection::connect`, steady-state reconnect
//! during publish is one bounded attempt with its own timeout (DESIGN.md).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::enrich::EnrichedRecord;
use crate::error::{ParserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    TrackData,
    Event,
    Alarm,
}

impl RecordType {
    fn as_str(self) -> &'static str {
        match self {
            RecordType::TrackData => "trackdata",
            RecordType::Event => "event",
            RecordType::Alarm => "alarm",
        }
    }

    fn priority(self) -> u8 {
        match self {
            RecordType::Alarm => 10,
            _ => 0,
        }
    }
}

/// Which of `trackdata`/`event`/`alarm` an enriched record must be published
/// as (§6): trackdata always, event iff `status != "Normal"`, alarm iff
/// `is_alarm`. A single alarm yields all three.
pub fn classify(record: &EnrichedRecord) -> Vec<RecordType> {
    let mut kinds = vec![RecordType::TrackData];
    if record.status != "Normal" {
        kinds.push(RecordType::Event);
    }
    if record.is_alarm {
        kinds.push(RecordType::Alarm);
    }
    kinds
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    message_id: String,
    vendor: &'static str,
    vendor_version: &'static str,
    timestamp: String,
    record_type: &'a str,
    imei: &'a str,
    device_ip: &'a str,
    device_port: u16,
    data: Value,
    metadata: Metadata<'a>,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    parser_node_id: &'a str,
}

fn envelope_json(
    record: &EnrichedRecord,
    kind: RecordType,
    device_ip: &str,
    device_port: u16,
    node_id: &str,
) -> serde_json::Result<String> {
    let data = serde_json::to_value(FlatEnrichedRecord::from(record))?;
    let envelope = Envelope {
        message_id: Uuid::new_v4().to_string(),
        vendor: "teltonika",
        vendor_version: "1.0",
        timestamp: Utc::now().to_rfc3339(),
        record_type: kind.as_str(),
        imei: &record.imei,
        device_ip,
        device_port,
        data,
        metadata: Metadata {
            parser_node_id: node_id,
        },
    };
    serde_json::to_string(&envelope)
}

/// Serializable projection of [`EnrichedRecord`] used as the envelope's
/// `data` object; flattens the schema columns alongside the fixed fields.
#[derive(Debug, Serialize)]
struct FlatEnrichedRecord {
    server_time: String,
    gps_time: String,
    lat: f64,
    lon: f64,
    altitude: i16,
    angle: u16,
    satellites: u8,
    speed: u16,
    event_id: u16,
    status: String,
    is_valid: bool,
    reference_id: Option<i64>,
    distance_km: Option<f64>,
    dynamic_io: serde_json::Map<String, Value>,
    io_data: serde_json::Map<String, Value>,
    #[serde(flatten)]
    columns: crate::schema::SchemaColumns,
}

impl From<&EnrichedRecord> for FlatEnrichedRecord {
    fn from(r: &EnrichedRecord) -> Self {
        Self {
            server_time: r.server_time.to_rfc3339(),
            gps_time: r.gps_time.to_rfc3339(),
            lat: r.lat,
            lon: r.lon,
            altitude: r.altitude,
            angle: r.angle,
            satellites: r.satellites,
            speed: r.speed,
            event_id: r.event_id,
            status: r.status.clone(),
            is_valid: r.is_valid,
            reference_id: r.reference_id,
            distance_km: r.distance_km,
            dynamic_io: r.dynamic_io.clone(),
            io_data: r.io_data.clone(),
            columns: r.columns.clone(),
        }
    }
}

/// Publishes enriched records to the broker, one message per required
/// classification, waiting on publisher confirms before returning.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        record: &EnrichedRecord,
        device_ip: &str,
        device_port: u16,
    ) -> Result<()>;

    /// Whether the publisher currently has a live broker connection, polled
    /// by the health endpoint (§4.9). Transport modes with no broker (the
    /// CSV sink) are always "connected".
    async fn is_connected(&self) -> bool {
        true
    }
}

pub struct LapinPublisher {
    channel: RwLock<Option<Channel>>,
    amqp_url: String,
    exchange: String,
    node_id: String,
    publish_timeout: Duration,
    reconnect_timeout: Duration,
    startup_backoff_cap: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl LapinPublisher {
    pub fn new(
        amqp_url: String,
        exchange: String,
        node_id: String,
        publish_timeout: Duration,
        reconnect_timeout: Duration,
        startup_backoff_cap: Duration,
    ) -> Self {
        Self {
            channel: RwLock::new(None),
            amqp_url,
            exchange,
            node_id,
            publish_timeout,
            reconnect_timeout,
            startup_backoff_cap,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    /// Unbounded-retry connect used at startup, since a parser with no
    /// broker reachable yet has nothing useful to do but keep trying.
    /// `lapin` has no `connect_robust`; this loop plays that role.
    pub async fn connect_with_backoff(&self) -> Result<()> {
        let mut backoff = Duration::from_millis(500);
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ParserError::Shutdown);
            }
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("broker connect failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.startup_backoff_cap);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let connection = Connection::connect(&self.amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;

        *self.channel.write().await = Some(channel);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<Channel> {
        if let Some(channel) = self.channel.read().await.clone() {
            if channel.status().connected() {
                return Ok(channel);
            }
        }
        tokio::time::timeout(self.reconnect_timeout, self.connect_once())
            .await
            .map_err(|_| ParserError::BrokerUnavailable("reconnect attempt timed out".into()))??;
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| ParserError::BrokerUnavailable("channel still absent after reconnect".into()))
    }

    async fn publish_one(
        &self,
        channel: &Channel,
        routing_key: &str,
        body: &[u8],
        priority: u8,
    ) -> Result<()> {
        let confirm = tokio::time::timeout(
            self.publish_timeout,
            channel.basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    ..Default::default()
                },
                body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_priority(priority),
            ),
        )
        .await
        .map_err(|_| ParserError::BrokerPublishTimeout(self.publish_timeout))?
        .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;

        tokio::time::timeout(self.publish_timeout, confirm)
            .await
            .map_err(|_| ParserError::BrokerPublishTimeout(self.publish_timeout))?
            .map_err(|e| ParserError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Publisher for LapinPublisher {
    async fn publish(
        &self,
        record: &EnrichedRecord,
        device_ip: &str,
        device_port: u16,
    ) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ParserError::Shutdown);
        }

        let channel = self.ensure_connected().await?;
        for kind in classify(record) {
            let body = envelope_json(record, kind, device_ip, device_port, &self.node_id)
                .map_err(|e| ParserError::Config(format!("envelope serialization: {e}")))?;
            let routing_key = format!("tracking.teltonika.{}", kind.as_str());
            self.publish_one(&channel, &routing_key, body.as_bytes(), kind.priority())
                .await?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.channel.read().await.as_ref() {
            Some(channel) => channel.status().connected(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaColumns;
    use chrono::Utc;

    fn sample(status: &str, is_alarm: bool) -> EnrichedRecord {
        EnrichedRecord {
            imei: "123456789012345".into(),
            server_time: Utc::now(),
            gps_time: Utc::now(),
            lat: 1.0,
            lon: 2.0,
            altitude: 10,
            angle: 90,
            satellites: 6,
            speed: 10,
            event_id: 1,
            status: status.into(),
            is_valid: true,
            reference_id: None,
            distance_km: None,
            dynamic_io: Default::default(),
            io_data: Default::default(),
            is_alarm,
            is_sms: false,
            is_email: false,
            is_call: false,
            columns: SchemaColumns::default(),
        }
    }

    #[test]
    fn normal_non_alarm_record_is_trackdata_only() {
        assert_eq!(classify(&sample("Normal", false)), vec![RecordType::TrackData]);
    }

    #[test]
    fn alarm_yields_three_classifications() {
        let kinds = classify(&sample("Ignition On", true));
        assert_eq!(
            kinds,
            vec![RecordType::TrackData, RecordType::Event, RecordType::Alarm]
        );
    }

    #[test]
    fn routing_key_and_priority_match_classification() {
        assert_eq!(RecordType::Alarm.priority(), 10);
        assert_eq!(RecordType::TrackData.priority(), 0);
    }
}
