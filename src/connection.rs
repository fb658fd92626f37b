//! Per-device connection handler (§4.7): the state machine
//! `ACCEPTED → AUTHENTICATING → READY ⇄ READING → CLOSING`. One task per
//! accepted TCP connection, reading frames, enriching and publishing
//! records, and ACKing the device only after every required broker
//! classification has confirmed — the crate's data-loss guarantee.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::Publisher;
use crate::codec::frame::{FrameSplitter, SplitEvent};
use crate::codec::{decode_payload, Payload};
use crate::command::CommandResponseSink;
use crate::directory::DeviceDirectory;
use crate::enrich::RecordEnricher;
use crate::error::{DecodeError, ParserError, Result};
use crate::load_reporter::Counters;
use crate::mapping::MappingCache;

pub struct ConnectionConfig {
    pub read_timeout: Duration,
    pub max_packet_size: usize,
    pub tcp_keepalive_idle: Duration,
    pub tcp_keepalive_interval: Duration,
    pub tcp_keepalive_count: u32,
}

/// Shared dependencies every connection task needs. Cheaply `Clone`able —
/// everything behind an `Arc`.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub mapping: Arc<MappingCache>,
    pub enricher: Arc<RecordEnricher>,
    pub publisher: Arc<dyn Publisher>,
    pub directory: DeviceDirectory,
    pub command_responses: Arc<dyn CommandResponseSink>,
    pub config: Arc<ConnectionConfig>,
    pub shutdown: CancellationToken,
    pub counters: Arc<Counters>,
}

/// Validates framing + digit-only length per §4.7: 2-byte length prefix
/// (first byte `0x00`, second byte `1..=20`), first 15 read bytes as ASCII
/// decimal digits. No checksum (Luhn-free), matching `input_validator.py`.
fn validate_imei(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 15 {
        return None;
    }
    let digits = &bytes[..15];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(String::from_utf8_lossy(digits).to_string())
}

async fn read_imei(stream: &mut TcpStream) -> Result<String> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x00 {
        return Err(ParserError::InvalidImei("length prefix high byte must be 0x00".into()));
    }
    let len = header[1] as usize;
    if !(1..=20).contains(&len) {
        return Err(ParserError::InvalidImei(format!("length byte {len} out of range 1..=20")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    validate_imei(&buf).ok_or_else(|| ParserError::InvalidImei(hex::encode(&buf)))
}

fn apply_keepalive(stream: &TcpStream, config: &ConnectionConfig) {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(config.tcp_keepalive_idle)
        .with_interval(config.tcp_keepalive_interval);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(config.tcp_keepalive_count);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        log::warn!("failed to set TCP keepalive: {e}");
    }
}

/// Runs one connection to completion: authenticate, then loop reading
/// frames until EOF, protocol error, or shutdown.
pub async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, deps: ConnectionDeps) {
    apply_keepalive(&stream, &deps.config);

    let imei = match read_imei(&mut stream).await {
        Ok(imei) => imei,
        Err(e) => {
            log::debug!("imei authentication failed for {addr}: {e}");
            return;
        }
    };

    if stream.write_all(&[0x01]).await.is_err() {
        return;
    }

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(16);
    deps.directory.register(addr, writer_tx).await;
    deps.directory.set_imei(addr, imei.clone()).await;

    let (mut read_half, mut write_half) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut splitter = FrameSplitter::new(deps.config.max_packet_size);
    let mut buf = vec![0u8; 8192];

    'outer: loop {
        if deps.shutdown.is_cancelled() {
            log::debug!("shutdown in progress, closing connection for imei {imei}");
            break;
        }

        let read_result = tokio::time::timeout(deps.config.read_timeout, read_half.read(&mut buf)).await;
        let n = match read_result {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                log::debug!("read error for imei {imei}: {e}");
                break;
            }
            Err(_) => continue, // read timeout with peer still alive; restart the loop
        };
        deps.counters.bytes_read.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);

        let events = match splitter.push(&buf[..n]) {
            Ok(events) => events,
            Err(DecodeError::FrameTooLarge { size, max }) => {
                let err = ParserError::FrameTooLarge { size, max };
                log::warn!("closing connection for imei {imei}: {err}");
                deps.counters.decode_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                break;
            }
            Err(e) => {
                log::warn!("decode error for imei {imei}, closing connection: {e}");
                deps.counters.decode_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                break;
            }
        };

        for event in events {
            match event {
                SplitEvent::Ping => {
                    deps.directory.touch(addr).await;
                }
                SplitEvent::Frame(frame) => {
                    deps.directory.touch(addr).await;
                    if !process_frame(&frame.payload, &imei, addr, &deps).await {
                        break 'outer;
                    }
                }
            }
        }
    }

    deps.directory.unregister(addr).await;
    writer_task.abort();
}

/// Decodes and publishes one frame's payload, ACKing through the writer
/// channel (never the raw socket directly — the writer task owns the write
/// half once the stream is split) only after every record's required
/// broker classifications have confirmed.
async fn process_frame(payload: &[u8], imei: &str, addr: SocketAddr, deps: &ConnectionDeps) -> bool {
    let decoded = match decode_payload(payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("codec decode error for imei {imei}: {e}");
            deps.counters.decode_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return false;
        }
    };

    match decoded.payload {
        Payload::Command(frame) => {
            if frame.frame_type == crate::codec::codec12::FrameType::Response {
                if let Err(e) = deps.command_responses.handle_response(imei, &frame.text).await {
                    log::warn!("command response handling failed for imei {imei}: {e}");
                }
            }
            true
        }
        Payload::Avl(records) => {
            let n = records.len();
            deps.counters.records_decoded.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
            let mappings = deps.mapping.mappings_for_imei(imei).await;

            let mut all_ok = true;
            for record in &records {
                let enriched = deps.enricher.enrich(imei, record, &mappings).await;
                let device_ip = addr.ip().to_string();
                if let Err(e) = deps.publisher.publish(&enriched, &device_ip, addr.port()).await {
                    log::warn!("publish failed for imei {imei}: {e}");
                    all_ok = false;
                }
            }

            if all_ok {
                if let Some(writer) = deps.directory.writer_for_imei(imei).await {
                    let ack = (n as u32).to_be_bytes().to_vec();
                    let _ = writer.send(ack).await;
                }
            }

            let _ = decoded.codec; // CodecKind retained on DecodedPayload for future per-codec metrics
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_imei_accepts_15_ascii_digits() {
        assert_eq!(
            validate_imei(b"123456789012345"),
            Some("123456789012345".to_string())
        );
    }

    #[test]
    fn validate_imei_rejects_non_digit_bytes() {
        assert_eq!(validate_imei(b"12345678901234X"), None);
    }

    #[test]
    fn validate_imei_rejects_short_input() {
        assert_eq!(validate_imei(b"123"), None);
    }
}
