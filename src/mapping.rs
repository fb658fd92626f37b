//! Per-IMEI IO mapping cache (§4.4): staleness via TTL and change detection,
//! LRU eviction, periodic inactive-device cleanup.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ParserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    Digital = 2,
    Analog = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Column = 0,
    Status = 1,
    Both = 2,
    Json = 3,
}

/// A single `unit_io_mapping` row (§3). Column-target mappings are split one
/// row per pipe-delimited column name at load time, matching the database
/// loader, so callers never need to re-split `column_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoMapping {
    pub imei: String,
    pub io_id: u16,
    pub multiplier: f64,
    pub io_type: IoType,
    pub io_name: String,
    pub value_name: String,
    pub trigger_value: Option<f64>,
    pub target: Target,
    pub column_name: String,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub is_alarm: bool,
    pub is_sms: bool,
    pub is_email: bool,
    pub is_call: bool,
    pub updated_at: DateTime<Utc>,
}

/// Where mappings come from: the production relational store, or a CSV
/// fixture for development and tests. Both yield the same [`IoMapping`] rows.
#[async_trait::async_trait]
pub trait MappingSource: Send + Sync {
    async fn load_for_imei(&self, imei: &str) -> Result<Vec<IoMapping>>;
    /// `MAX(updated_at)` for the IMEI, used for change detection. Sources
    /// that can't cheaply compute this (CSV fixtures) return `None`, which
    /// disables change detection and falls back to the TTL alone.
    async fn max_updated_at(&self, imei: &str) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Debug, Clone)]
pub struct MappingCacheConfig {
    pub ttl: Duration,
    pub max_imeis: usize,
    pub inactive_cleanup_after: Duration,
    pub cleanup_interval: Duration,
    pub check_store_changes: bool,
}

impl Default for MappingCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_imeis: 10_000,
            inactive_cleanup_after: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            check_store_changes: true,
        }
    }
}

struct CacheEntry {
    by_io_id: HashMap<u16, Vec<IoMapping>>,
    cached_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    max_updated_at: Option<DateTime<Utc>>,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Least-recently-used ordering; the front is the eviction candidate.
    /// A `HashMap` doesn't preserve insertion/access order, so this tracks
    /// it explicitly rather than reaching for an external LRU crate.
    lru: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, imei: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == imei) {
            self.lru.remove(pos);
        }
        self.lru.push_back(imei.to_string());
    }

    fn remove(&mut self, imei: &str) {
        self.entries.remove(imei);
        if let Some(pos) = self.lru.iter().position(|k| k == imei) {
            self.lru.remove(pos);
        }
    }
}

/// Per-IMEI, per-IO-ID mapping cache guarded by a single `RwLock`. Lookups
/// take the read path in the common case (cache fresh); loads and eviction
/// take the write path. No dedicated async LRU crate appears anywhere in
/// the corpus, so eviction order is hand-tracked in a `VecDeque`.
pub struct MappingCache {
    state: RwLock<CacheState>,
    source: Box<dyn MappingSource>,
    config: MappingCacheConfig,
}

impl MappingCache {
    pub fn new(source: Box<dyn MappingSource>, config: MappingCacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
            source,
            config,
        }
    }

    /// Returns the mappings for `(imei, io_id)`, force-loading the IMEI on
    /// first sight and reloading it if stale. A load failure keeps the
    /// previous entry (if any) and is logged, rather than propagated —
    /// a device that can't currently refresh its mappings should still get
    /// enriched with whatever was last known good.
    pub async fn get(&self, imei: &str, io_id: u16) -> Vec<IoMapping> {
        self.mappings_for_imei(imei)
            .await
            .get(&io_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns every mapping row known for `imei`, keyed by `io_id`,
    /// force-loading/refreshing exactly as [`MappingCache::get`] does. The
    /// enricher uses this once per record rather than calling `get` per
    /// property, both to avoid re-locking per IO and to answer "does this
    /// IMEI have any mappings at all" for the dynamic_io fallback (§4.5).
    pub async fn mappings_for_imei(&self, imei: &str) -> HashMap<u16, Vec<IoMapping>> {
        if self.is_stale(imei).await {
            if let Err(e) = self.reload(imei).await {
                log::warn!("mapping reload failed for imei {imei}: {e}");
            }
        }

        let mut state = self.state.write().await;
        state.touch(imei);
        state
            .entries
            .get(imei)
            .map(|e| e.by_io_id.clone())
            .unwrap_or_default()
    }

    async fn is_stale(&self, imei: &str) -> bool {
        let snapshot = {
            let state = self.state.read().await;
            state.entries.get(imei).map(|e| (e.cached_at, e.max_updated_at))
        };

        let (cached_at, cached_max) = match snapshot {
            Some(v) => v,
            None => return true,
        };

        if Utc::now().signed_duration_since(cached_at).to_std().unwrap_or(Duration::MAX) > self.config.ttl {
            return true;
        }

        if self.config.check_store_changes {
            match self.source.max_updated_at(imei).await {
                Ok(Some(store_max)) => match cached_max {
                    Some(cached) if store_max <= cached => false,
                    _ => true,
                },
                Ok(None) => false,
                Err(e) => {
                    log::warn!("change-detection query failed for imei {imei}: {e}, falling back to TTL");
                    false
                }
            }
        } else {
            false
        }
    }

    async fn reload(&self, imei: &str) -> Result<()> {
        let rows = self
            .source
            .load_for_imei(imei)
            .await
            .map_err(|e| ParserError::MappingLoadFailed {
                imei: imei.to_string(),
                reason: e.to_string(),
            })?;
        let max_updated_at = rows.iter().map(|m| m.updated_at).max();

        let mut by_io_id: HashMap<u16, Vec<IoMapping>> = HashMap::new();
        for row in rows {
            by_io_id.entry(row.io_id).or_default().push(row);
        }

        let mut state = self.state.write().await;
        state.entries.insert(
            imei.to_string(),
            CacheEntry {
                by_io_id,
                cached_at: Utc::now(),
                last_access: Utc::now(),
                max_updated_at,
            },
        );
        state.touch(imei);
        self.enforce_cap(&mut state);
        Ok(())
    }

    fn enforce_cap(&self, state: &mut CacheState) {
        while state.entries.len() > self.config.max_imeis {
            if let Some(evicted) = state.lru.pop_front() {
                state.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }

    /// Evicts IMEIs whose last access predates the inactive-cleanup window.
    /// Intended to run on [`MappingCacheConfig::cleanup_interval`].
    pub async fn evict_inactive(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.inactive_cleanup_after).unwrap_or_default();
        let mut state = self.state.write().await;
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.last_access < cutoff)
            .map(|(imei, _)| imei.clone())
            .collect();
        for imei in &stale {
            state.remove(imei);
        }
        stale.len()
    }
}

/// Reads `unit_io_mapping` rows for an IMEI from Postgres, expanding each
/// row into one or more [`IoMapping`]s exactly as
/// `unit_io_mapping_loader.py::load_mappings_for_imei` does: a status-only
/// row for `target ∈ {1,2}`, one row per pipe-split (non-empty, non-
/// `"status"`) column name for `target ∈ {0,2}`, and a single JSON-target
/// row for `target=3` with a non-empty `column_name`. A zero-row result is
/// a legitimate "no mappings for this IMEI" answer, not an error.
pub struct DbMappingSource {
    pool: sqlx::PgPool,
}

impl DbMappingSource {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UnitIoMappingRow {
    imei: String,
    io_id: i32,
    io_multiplier: f64,
    io_type: i32,
    io_name: String,
    value_name: String,
    value: Option<f64>,
    target: i32,
    column_name: String,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    is_alarm: bool,
    is_sms: bool,
    is_email: bool,
    is_call: bool,
    updated_at: DateTime<Utc>,
}

fn expand_row(row: UnitIoMappingRow) -> Vec<IoMapping> {
    let io_type = if row.io_type == 2 { IoType::Digital } else { IoType::Analog };
    let base = |target: Target, column_name: String| IoMapping {
        imei: row.imei.clone(),
        io_id: row.io_id as u16,
        multiplier: row.io_multiplier,
        io_type,
        io_name: row.io_name.clone(),
        value_name: row.value_name.clone(),
        trigger_value: row.value,
        target,
        column_name,
        window_start: row.start_time,
        window_end: row.end_time,
        is_alarm: row.is_alarm,
        is_sms: row.is_sms,
        is_email: row.is_email,
        is_call: row.is_call,
        updated_at: row.updated_at,
    };

    let mut out = Vec::new();
    if matches!(row.target, 1 | 2) {
        out.push(base(Target::Status, String::new()));
    }
    if matches!(row.target, 0 | 2) {
        for name in row.column_name.split('|').map(str::trim) {
            if !name.is_empty() && name != "status" {
                out.push(base(Target::Column, name.to_string()));
            }
        }
    }
    if row.target == 3 && !row.column_name.trim().is_empty() {
        out.push(base(Target::Json, row.column_name.trim().to_string()));
    }
    out
}

#[async_trait::async_trait]
impl MappingSource for DbMappingSource {
    async fn load_for_imei(&self, imei: &str) -> Result<Vec<IoMapping>> {
        let rows: Vec<UnitIoMappingRow> = sqlx::query_as(
            "SELECT imei, io_id, io_multiplier, io_type, io_name, value_name, value, target, \
             column_name, start_time, end_time, is_alarm, is_sms, is_email, is_call, updated_at \
             FROM unit_io_mapping WHERE imei = $1",
        )
        .bind(imei)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().flat_map(expand_row).collect())
    }

    async fn max_updated_at(&self, imei: &str) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(updated_at) FROM unit_io_mapping WHERE imei = $1")
                .bind(imei)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

/// CSV fixture loader for dev/test and `LOGS` mode (§4.4), reading the same
/// row shape as the database loader from a single file loaded once and
/// filtered in memory per IMEI. Has no cheap way to answer "what changed
/// since I last loaded", so [`MappingSource::max_updated_at`] always
/// returns `None`, which disables change detection and leaves the TTL as
/// the only staleness signal — matching the original CSV loader, which
/// never re-reads the file at all once loaded.
pub struct CsvMappingSource {
    rows: Vec<IoMapping>,
}

impl CsvMappingSource {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())
            .map_err(|e| ParserError::MappingLoadFailed {
                imei: "*".to_string(),
                reason: format!("opening csv fixture {}: {e}", path.as_ref().display()),
            })?;

        let headers: HashMap<String, usize> = reader
            .headers()
            .map_err(|e| ParserError::MappingLoadFailed {
                imei: "*".to_string(),
                reason: e.to_string(),
            })?
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ParserError::MappingLoadFailed {
                imei: "*".to_string(),
                reason: e.to_string(),
            })?;
            if let Some(row) = Self::parse_record(&record, &headers) {
                rows.extend(expand_csv_row(row));
            } else {
                log::warn!("skipping malformed csv mapping row: {record:?}");
            }
        }
        Ok(Self { rows })
    }

    fn parse_record(record: &csv::StringRecord, headers: &HashMap<String, usize>) -> Option<CsvRow> {
        let get = |name: &str| -> Option<&str> { record.get(*headers.get(name)?) };
        let get_or = |name: &str, default: &str| get(name).unwrap_or(default);

        Some(CsvRow {
            imei: get("imei")?.to_string(),
            io_id: get("io_id")?.parse().ok()?,
            io_multiplier: get_or("io_multiplier", "1.0").parse().unwrap_or(1.0),
            io_type: get("io_type")?.parse().ok()?,
            io_name: get_or("io_name", "").to_string(),
            value_name: get_or("value_name", "").to_string(),
            value: get("value").and_then(|v| v.parse().ok()),
            target: get("target")?.parse().ok()?,
            column_name: get_or("column_name", "").to_string(),
            start_time: chrono::NaiveTime::parse_from_str(get_or("start_time", "00:00:00"), "%H:%M:%S").ok()?,
            end_time: chrono::NaiveTime::parse_from_str(get_or("end_time", "23:59:59"), "%H:%M:%S").ok()?,
            is_alarm: get_or("is_alarm", "false").parse().unwrap_or(false),
            is_sms: get_or("is_sms", "false").parse().unwrap_or(false),
            is_email: get_or("is_email", "false").parse().unwrap_or(false),
            is_call: get_or("is_call", "false").parse().unwrap_or(false),
        })
    }
}

struct CsvRow {
    imei: String,
    io_id: u16,
    io_multiplier: f64,
    io_type: i32,
    io_name: String,
    value_name: String,
    value: Option<f64>,
    target: i32,
    column_name: String,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    is_alarm: bool,
    is_sms: bool,
    is_email: bool,
    is_call: bool,
}

fn expand_csv_row(row: CsvRow) -> Vec<IoMapping> {
    let io_type = if row.io_type == 2 { IoType::Digital } else { IoType::Analog };
    let base = |target: Target, column_name: String| IoMapping {
        imei: row.imei.clone(),
        io_id: row.io_id,
        multiplier: row.io_multiplier,
        io_type,
        io_name: row.io_name.clone(),
        value_name: row.value_name.clone(),
        trigger_value: row.value,
        target,
        column_name,
        window_start: row.start_time,
        window_end: row.end_time,
        is_alarm: row.is_alarm,
        is_sms: row.is_sms,
        is_email: row.is_email,
        is_call: row.is_call,
        updated_at: Utc::now(),
    };

    let mut out = Vec::new();
    if matches!(row.target, 1 | 2) {
        out.push(base(Target::Status, String::new()));
    }
    if matches!(row.target, 0 | 2) {
        for name in row.column_name.split('|').map(str::trim) {
            if !name.is_empty() && name != "status" {
                out.push(base(Target::Column, name.to_string()));
            }
        }
    }
    if row.target == 3 && !row.column_name.trim().is_empty() {
        out.push(base(Target::Json, row.column_name.trim().to_string()));
    }
    out
}

#[async_trait::async_trait]
impl MappingSource for CsvMappingSource {
    async fn load_for_imei(&self, imei: &str) -> Result<Vec<IoMapping>> {
        Ok(self.rows.iter().filter(|r| r.imei == imei).cloned().collect())
    }

    async fn max_updated_at(&self, _imei: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedSource {
        rows: Mutex<Vec<IoMapping>>,
    }

    #[async_trait::async_trait]
    impl MappingSource for FixedSource {
        async fn load_for_imei(&self, _imei: &str) -> Result<Vec<IoMapping>> {
            Ok(self.rows.lock().unwrap().clone())
        }
        async fn max_updated_at(&self, _imei: &str) -> Result<Option<DateTime<Utc>>> {
            Ok(self.rows.lock().unwrap().iter().map(|m| m.updated_at).max())
        }
    }

    fn sample_mapping(io_id: u16) -> IoMapping {
        IoMapping {
            imei: "123".into(),
            io_id,
            multiplier: 1.0,
            io_type: IoType::Digital,
            io_name: "Ignition".into(),
            value_name: "On".into(),
            trigger_value: Some(1.0),
            target: Target::Both,
            column_name: "".into(),
            window_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            is_alarm: true,
            is_sms: false,
            is_email: false,
            is_call: false,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn loads_and_serves_mappings_for_an_imei() {
        let source = FixedSource {
            rows: Mutex::new(vec![sample_mapping(1)]),
        };
        let cache = MappingCache::new(Box::new(source), MappingCacheConfig::default());
        let mappings = cache.get("123", 1).await;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].io_name, "Ignition");
    }

    #[tokio::test]
    async fn unknown_io_id_yields_empty_list() {
        let source = FixedSource {
            rows: Mutex::new(vec![sample_mapping(1)]),
        };
        let cache = MappingCache::new(Box::new(source), MappingCacheConfig::default());
        assert!(cache.get("123", 99).await.is_empty());
    }

    #[tokio::test]
    async fn lru_cap_of_one_evicts_previous_imei() {
        let source = FixedSource {
            rows: Mutex::new(vec![sample_mapping(1)]),
        };
        let mut config = MappingCacheConfig::default();
        config.max_imeis = 1;
        let cache = MappingCache::new(Box::new(source), config);
        cache.get("imei-a", 1).await;
        cache.get("imei-b", 1).await;
        let state = cache.state.read().await;
        assert!(!state.entries.contains_key("imei-a"));
        assert!(state.entries.contains_key("imei-b"));
    }
}
