//! `LOGS` data-transfer mode (§6): writes enriched records to fixed-column
//! CSV files instead of publishing to a broker, for devices/dev setups
//! without RabbitMQ. Mirrors `async_save_to_csv.py`'s column order and the
//! broker's own record classification so both modes produce the same
//! logical fan-out (`trackdata.csv` always, `events.csv`/`alarms.csv`
//! conditionally).

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::broker::{classify, RecordType};
use crate::enrich::EnrichedRecord;
use crate::error::Result;
use crate::schema::CSV_COLUMN_ORDER;

/// Common header used by every sink file, ahead of the enumerated schema
/// columns from [`CSV_COLUMN_ORDER`].
const FIXED_COLUMNS: &[&str] = &[
    "imei",
    "server_time",
    "gps_time",
    "lat",
    "lon",
    "altitude",
    "angle",
    "satellites",
    "speed",
    "event_id",
    "status",
    "reference_id",
    "distance_km",
];

struct SinkFile {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl SinkFile {
    fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(name),
            writer: Mutex::new(None),
        }
    }

    async fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let is_new = !self.path.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            if is_new {
                let mut header = FIXED_COLUMNS.join(",");
                header.push(',');
                header.push_str(&CSV_COLUMN_ORDER.join(","));
                header.push('\n');
                file.write_all(header.as_bytes()).await?;
            }
            *guard = Some(file);
        }
        let file = guard.as_mut().unwrap();
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn row_for(record: &EnrichedRecord) -> String {
    let mut fields = vec![
        record.imei.clone(),
        record.server_time.to_rfc3339(),
        record.gps_time.to_rfc3339(),
        record.lat.to_string(),
        record.lon.to_string(),
        record.altitude.to_string(),
        record.angle.to_string(),
        record.satellites.to_string(),
        record.speed.to_string(),
        record.event_id.to_string(),
        record.status.clone(),
        record.reference_id.map(|v| v.to_string()).unwrap_or_default(),
        record.distance_km.map(|v| v.to_string()).unwrap_or_default(),
    ];
    for column in CSV_COLUMN_ORDER {
        let value = match *column {
            "dynamic_io" => {
                if record.dynamic_io.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&record.dynamic_io).unwrap_or_default()
                }
            }
            "is_valid" => (record.is_valid as u8).to_string(),
            name => record.columns.get_by_name(name).unwrap_or("").to_string(),
        };
        fields.push(value);
    }
    fields.into_iter().map(|f| csv_escape(&f)).collect::<Vec<_>>().join(",")
}

pub struct CsvSink {
    trackdata: SinkFile,
    events: SinkFile,
    alarms: SinkFile,
}

impl CsvSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            trackdata: SinkFile::new(dir, "trackdata.csv"),
            events: SinkFile::new(dir, "events.csv"),
            alarms: SinkFile::new(dir, "alarms.csv"),
        }
    }

    pub async fn write(&self, record: &EnrichedRecord) -> Result<()> {
        let line = row_for(record);
        for kind in classify(record) {
            let file = match kind {
                RecordType::TrackData => &self.trackdata,
                RecordType::Event => &self.events,
                RecordType::Alarm => &self.alarms,
            };
            file.append(&line).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::broker::Publisher for CsvSink {
    async fn publish(&self, record: &EnrichedRecord, _device_ip: &str, _device_port: u16) -> Result<()> {
        self.write(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaColumns;
    use chrono::Utc;

    fn sample() -> EnrichedRecord {
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
            status: "Normal".into(),
            is_valid: true,
            reference_id: Some(7),
            distance_km: Some(1.25),
            dynamic_io: Default::default(),
            io_data: Default::default(),
            is_alarm: false,
            is_sms: false,
            is_email: false,
            is_call: false,
            columns: SchemaColumns::default(),
        }
    }

    #[tokio::test]
    async fn writes_trackdata_row_for_a_normal_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        sink.write(&sample()).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("trackdata.csv"))
            .await
            .unwrap();
        assert!(contents.contains("123456789012345"));
        assert!(!dir.path().join("events.csv").exists());
    }

    #[test]
    fn csv_escape_quotes_commas() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("plain"), "plain");
    }
}
