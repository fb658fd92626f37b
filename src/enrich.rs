//! Record enrichment (§4.5): turns a decoded [`AvlRecord`] plus the IMEI's
//! mapping rows into the schema-shaped envelope the broker and CSV sink
//! publish. Grounded in `async_packet_parser.py`'s
//! `_format_avl_record_to_dict` / `_calculate_decimal_places` /
//! `_format_io_value` / `_check_temperature_error_code` / `_is_time_in_window`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::{Map, Value};

use crate::codec::avl::{AvlRecord, IoValue};
use crate::mapping::{IoMapping, IoType, Target};
use crate::schema::SchemaColumns;

/// Fully enriched record, ready to be classified and published.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub imei: String,
    pub server_time: DateTime<Utc>,
    pub gps_time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i16,
    pub angle: u16,
    pub satellites: u8,
    pub speed: u16,
    pub event_id: u16,
    pub status: String,
    pub is_valid: bool,
    pub reference_id: Option<i64>,
    pub distance_km: Option<f64>,
    pub dynamic_io: Map<String, Value>,
    /// Raw `io_<id>` (decimal) and `io_<ID>` (uppercase hex) dump of every
    /// property on the record, independent of `dynamic_io` and unaffected by
    /// whether a mapping exists. Debugging/observability side-channel, not
    /// required by any published schema column.
    pub io_data: Map<String, Value>,
    pub is_alarm: bool,
    pub is_sms: bool,
    pub is_email: bool,
    pub is_call: bool,
    pub columns: SchemaColumns,
}

/// Number of fractional digits to keep when formatting a value scaled by
/// `multiplier`, matching `_calculate_decimal_places`: format at high
/// precision, trim trailing zeros, count what's left after the point.
/// A multiplier of `1.0` or `0.0` means "no scaling", hence zero decimals.
pub fn decimals(multiplier: f64) -> usize {
    if multiplier == 1.0 || multiplier == 0.0 {
        return 0;
    }
    let formatted = format!("{multiplier:.10}");
    let trimmed = formatted.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len(),
        None => 0,
    }
}

fn format_value(raw: f64, multiplier: f64, io_type: IoType) -> String {
    if io_type == IoType::Digital && multiplier == 1.0 {
        return format!("{}", raw as i64);
    }
    let scaled = raw * multiplier;
    let places = decimals(multiplier);
    format!("{scaled:.places$}")
}

/// Dallas 1-Wire sensor sentinel/error codes (°C × 100 on the wire).
fn dallas_error_code(raw: f64) -> Option<&'static str> {
    match raw as i64 {
        850 | 5000 => Some("not_ready"),
        2000 => Some("read_error"),
        3000 => Some("disconnected"),
        4000 => Some("id_failed"),
        _ => None,
    }
}

/// BLE sensor sentinel/error codes.
fn ble_error_code(raw: f64) -> Option<&'static str> {
    match raw as i64 {
        4000 => Some("abnormal"),
        3000 => Some("not_found"),
        2000 => Some("parse_fail"),
        _ => None,
    }
}

fn io_value_to_json(value: &IoValue) -> Value {
    match value {
        IoValue::Variable(bytes) => Value::String(hex::encode(bytes)),
        other => other.as_f64().map(Value::from).unwrap_or(Value::Null),
    }
}

fn temperature_error_code(io_name: &str, raw: f64) -> Option<&'static str> {
    let lower = io_name.to_lowercase();
    if !lower.contains("temperature") {
        return None;
    }
    if lower.contains("ble") {
        ble_error_code(raw)
    } else if lower.contains("dallas") {
        dallas_error_code(raw)
    } else {
        None
    }
}

/// Midnight-wrapping time-of-day window check (`_is_time_in_window`): a
/// window where `start > end` wraps past midnight (e.g. 22:00-06:00).
fn time_in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

/// Looks up a reference location (town, zone, depot...) near a decoded
/// fix, gated on the fix being valid and non-zero (§4.5, §4.9).
#[async_trait::async_trait]
pub trait LocationReference: Send + Sync {
    async fn nearest(&self, lat: f64, lon: f64, max_km: f64) -> crate::error::Result<Option<LocationMatch>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationMatch {
    pub reference_id: i64,
    pub distance_km: f64,
}

pub struct RecordEnricher {
    location: Option<Arc<dyn LocationReference>>,
    max_distance_km: f64,
}

impl RecordEnricher {
    pub fn new(location: Option<Arc<dyn LocationReference>>, max_distance_km: f64) -> Self {
        Self {
            location,
            max_distance_km,
        }
    }

    /// Enriches one decoded record. `mappings` is the IMEI's full mapping
    /// map keyed by `io_id`, as returned by `MappingCache::mappings_for_imei`
    /// — fetched once per record rather than once per property, both for
    /// lock efficiency and because the dynamic_io fallback (step 6 below)
    /// needs to know whether the IMEI has *any* mappings at all.
    pub async fn enrich(
        &self,
        imei: &str,
        record: &AvlRecord,
        mappings: &HashMap<u16, Vec<IoMapping>>,
    ) -> EnrichedRecord {
        // 1. lon/lat to decimal degrees, validity.
        let lat = record.gps.lat_e7 as f64 / 1e7;
        let lon = record.gps.lon_e7 as f64 / 1e7;
        let is_valid = !(lat == 0.0 && lon == 0.0);

        // 2. status defaults to "Normal" until a status mapping overrides it.
        let mut status = "Normal".to_string();
        let mut is_alarm = false;
        let mut is_sms = false;
        let mut is_email = false;
        let mut is_call = false;

        // 3. status resolution: the mapping for the property whose id equals
        // event_id, whose target includes Status, whose trigger_value exactly
        // matches the property's numeric value, and whose alarm time window
        // (if any) contains gps_time.
        let gps_time = record.timestamp;
        if let Some(event_property) = record.properties.iter().find(|p| p.id == record.event_id) {
            if let Some(candidates) = mappings.get(&record.event_id) {
                let event_value = event_property.value.as_f64();
                if let Some(status_mapping) = candidates.iter().find(|m| {
                    m.io_type == IoType::Digital
                        && matches!(m.target, Target::Status | Target::Both)
                        && m.trigger_value.zip(event_value).map_or(false, |(t, v)| t == v)
                }) {
                    status = format!("{} {}", status_mapping.io_name, status_mapping.value_name);
                    let in_window = time_in_window(
                        gps_time.time(),
                        status_mapping.window_start,
                        status_mapping.window_end,
                    );
                    is_alarm = status_mapping.is_alarm && in_window;
                    is_sms = status_mapping.is_sms && in_window;
                    is_email = status_mapping.is_email && in_window;
                    is_call = status_mapping.is_call && in_window;
                }
            }
        }

        // 4/5. per-property column/json writes, multiplier formatting,
        // temperature sentinel overrides; plus the raw io_data side-channel,
        // built for every property regardless of mapping.
        let mut columns = SchemaColumns::default();
        let mut dynamic_io = Map::new();
        let mut io_data = Map::new();
        for property in &record.properties {
            let json_value = io_value_to_json(&property.value);
            io_data.insert(format!("io_{}", property.id), json_value.clone());
            io_data.insert(format!("io_{:02X}", property.id), json_value);
        }
        for property in &record.properties {
            let Some(raw) = property.value.as_f64() else {
                continue;
            };
            if raw == 0.0 {
                continue;
            }
            let Some(candidates) = mappings.get(&property.id) else {
                continue;
            };
            for mapping in candidates {
                if !matches!(mapping.target, Target::Column | Target::Both | Target::Json) {
                    continue;
                }
                let formatted = match temperature_error_code(&mapping.io_name, raw) {
                    Some(code) => code.to_string(),
                    None => format_value(raw, mapping.multiplier, mapping.io_type),
                };
                match mapping.target {
                    Target::Json => {
                        dynamic_io.insert(mapping.column_name.clone(), Value::String(formatted));
                    }
                    _ => {
                        if !columns.set_by_name(&mapping.column_name, formatted.clone()) {
                            log::debug!(
                                "unrecognized schema column '{}' for imei {imei}, io {}",
                                mapping.column_name,
                                property.id
                            );
                            dynamic_io.insert(mapping.column_name.clone(), Value::String(formatted));
                        }
                    }
                }
            }
        }

        // 6. dynamic_io fallback: only when the whole IMEI has no mapping
        // rows at all, not merely no mapping for this particular property.
        if mappings.is_empty() {
            for property in &record.properties {
                dynamic_io.insert(format!("io_{}", property.id), io_value_to_json(&property.value));
            }
        }

        // 7/8. location reference lookup, gated on validity and non-zero fix.
        let (reference_id, distance_km) = if is_valid && (lat, lon) != (0.0, 0.0) {
            match &self.location {
                Some(loc) => match loc.nearest(lat, lon, self.max_distance_km).await {
                    Ok(Some(m)) => (Some(m.reference_id), Some(m.distance_km)),
                    Ok(None) => (None, None),
                    Err(e @ crate::error::ParserError::DatabaseUnavailable(_)) => {
                        log::debug!("location lookup failed for imei {imei}: {e}");
                        (None, None)
                    }
                    Err(e) => {
                        log::warn!("location lookup failed for imei {imei}: {e}");
                        (None, None)
                    }
                },
                None => (None, None),
            }
        } else {
            (None, None)
        };

        EnrichedRecord {
            imei: imei.to_string(),
            server_time: Utc::now(),
            gps_time,
            lat,
            lon,
            altitude: record.gps.altitude_m,
            angle: record.gps.angle_deg,
            satellites: record.gps.satellites,
            speed: record.gps.speed_kmh,
            event_id: record.event_id,
            status,
            is_valid,
            reference_id,
            distance_km,
            dynamic_io,
            io_data,
            is_alarm,
            is_sms,
            is_email,
            is_call,
            columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::avl::{GpsElement, Priority};
    use chrono::TimeZone;

    fn gps(lat_e7: i32, lon_e7: i32) -> GpsElement {
        GpsElement {
            lon_e7,
            lat_e7,
            altitude_m: 10,
            angle_deg: 90,
            satellites: 6,
            speed_kmh: 40,
        }
    }

    fn record(event_id: u16, properties: Vec<crate::codec::avl::IoProperty>) -> AvlRecord {
        AvlRecord {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            priority: Priority::Low,
            gps: gps(50_000_000, 10_000_000),
            event_id,
            origin_type: None,
            properties,
        }
    }

    #[test]
    fn decimals_trims_trailing_zeros() {
        assert_eq!(decimals(1.0), 0);
        assert_eq!(decimals(0.001), 3);
        assert_eq!(decimals(0.1), 1);
    }

    #[tokio::test]
    async fn enrich_applies_column_mapping_with_multiplier() {
        let mapping = IoMapping {
            imei: "123".into(),
            io_id: 66,
            multiplier: 0.001,
            io_type: IoType::Analog,
            io_name: "battery_voltage".into(),
            value_name: String::new(),
            trigger_value: None,
            target: Target::Column,
            column_name: "battery_voltage".into(),
            window_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            is_alarm: false,
            is_sms: false,
            is_email: false,
            is_call: false,
            updated_at: Utc::now(),
        };
        let mut mappings = HashMap::new();
        mappings.insert(66u16, vec![mapping]);

        let rec = record(
            1,
            vec![crate::codec::avl::IoProperty {
                id: 66,
                value: IoValue::U16(12500),
            }],
        );

        let enricher = RecordEnricher::new(None, 50.0);
        let enriched = enricher.enrich("123", &rec, &mappings).await;
        assert_eq!(enriched.columns.battery_voltage.as_deref(), Some("12.500"));
        assert!(enriched.dynamic_io.is_empty());
    }

    #[tokio::test]
    async fn dynamic_io_fallback_only_when_imei_has_no_mappings() {
        let rec = record(
            1,
            vec![crate::codec::avl::IoProperty {
                id: 17,
                value: IoValue::U8(3),
            }],
        );
        let enricher = RecordEnricher::new(None, 50.0);
        let enriched = enricher.enrich("999", &rec, &HashMap::new()).await;
        assert_eq!(enriched.dynamic_io.get("io_17"), Some(&Value::from(3.0)));
    }

    #[test]
    fn status_window_wraps_past_midnight() {
        let start = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert!(time_in_window(NaiveTime::from_hms_opt(23, 0, 0).unwrap(), start, end));
        assert!(time_in_window(NaiveTime::from_hms_opt(1, 0, 0).unwrap(), start, end));
        assert!(!time_in_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), start, end));
    }

    #[test]
    fn temperature_sentinel_detected_for_dallas_sensor() {
        assert_eq!(temperature_error_code("dallas_temperature_1", 3000.0), Some("disconnected"));
        assert_eq!(temperature_error_code("ble_temperature_2", 4000.0), Some("abnormal"));
        assert_eq!(temperature_error_code("fuel", 3000.0), None);
    }
}
