//! Durable store: one table per series category plus an append-only
//! incidents table, backed by SQLite in WAL mode.
//!
//! Grounded on `signals/db_storage.rs`'s `SCHEMA_SQL` + `Connection::
//! open_with_flags(..., SQLITE_OPEN_NO_MUTEX)` pattern: the application
//! serializes its own access via `Arc<Mutex<Connection>>` rather than
//! relying on SQLite's internal mutex.

use crate::model::{Incident, IncidentKind, IncidentTarget, Observation, SeriesCategory, ValidationFlags};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

const INCIDENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS incidents (
    incident_id TEXT PRIMARY KEY,
    series_key TEXT,
    source_id TEXT,
    kind TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    detail TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_incidents_detected_at ON incidents(detected_at DESC);
CREATE INDEX IF NOT EXISTS idx_incidents_open_escalation ON incidents(kind, resolved_at);
"#;

fn observation_table_schema(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    series_key TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    value REAL NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume REAL,
    change_abs REAL,
    change_pct REAL,
    unit TEXT,
    source_id TEXT NOT NULL,
    fetch_time TEXT NOT NULL,
    validation_flags INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (series_key, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_{table}_series_ts_desc ON {table}(series_key, timestamp DESC);
"#
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub struct DurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl DurableStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open durable store at {db_path}"))?;

        conn.execute_batch(PRAGMAS).context("failed to set pragmas")?;
        conn.execute_batch(INCIDENTS_SCHEMA).context("failed to init incidents schema")?;

        for category in SeriesCategory::all() {
            conn.execute_batch(&observation_table_schema(category.table_name()))
                .with_context(|| format!("failed to init schema for {}", category.table_name()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert_observation(&self, obs: &Observation, category: SeriesCategory) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let table = category.table_name();
        let sql = format!(
            "INSERT OR IGNORE INTO {table} \
             (series_key, timestamp, value, open, high, low, close, volume, \
              change_abs, change_pct, unit, source_id, fetch_time, validation_flags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        );
        let changed = conn.execute(
            &sql,
            params![
                obs.series_key,
                obs.timestamp.to_rfc3339(),
                obs.value,
                obs.open,
                obs.high,
                obs.low,
                obs.close,
                obs.volume,
                obs.change_abs,
                obs.change_pct,
                obs.unit,
                obs.source_id,
                obs.fetch_time.to_rfc3339(),
                obs.validation_flags.0,
            ],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    pub fn get_latest(&self, series_key: &str, category: SeriesCategory) -> Result<Option<Observation>> {
        let conn = self.conn.lock();
        let table = category.table_name();
        let sql = format!(
            "SELECT series_key, timestamp, value, open, high, low, close, volume, \
                    change_abs, change_pct, unit, source_id, fetch_time, validation_flags \
             FROM {table} WHERE series_key = ?1 ORDER BY timestamp DESC LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![series_key], row_to_observation)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    pub fn get_range(
        &self,
        series_key: &str,
        category: SeriesCategory,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Observation>> {
        let conn = self.conn.lock();
        let table = category.table_name();
        let sql = format!(
            "SELECT series_key, timestamp, value, open, high, low, close, volume, \
                    change_abs, change_pct, unit, source_id, fetch_time, validation_flags \
             FROM {table} \
             WHERE series_key = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp DESC LIMIT ?4"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let limit = limit.unwrap_or(10_000) as i64;
        let rows = stmt
            .query_map(
                params![series_key, from.to_rfc3339(), to.to_rfc3339(), limit],
                row_to_observation,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_incident(&self, incident: &Incident) -> Result<()> {
        let conn = self.conn.lock();
        let (series_key, source_id) = match &incident.target {
            IncidentTarget::Series { series_key } => (Some(series_key.clone()), None),
            IncidentTarget::Source { source_id } => (None, Some(source_id.clone())),
            IncidentTarget::Global => (None, None),
        };
        conn.execute(
            "INSERT INTO incidents (incident_id, series_key, source_id, kind, detected_at, resolved_at, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                incident.incident_id,
                series_key,
                source_id,
                kind_str(incident.kind),
                incident.detected_at.to_rfc3339(),
                incident.resolved_at.map(|t| t.to_rfc3339()),
                incident.detail,
            ],
        )?;
        Ok(())
    }

    pub fn resolve_incident(&self, incident_id: &str, resolved_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE incidents SET resolved_at = ?1 WHERE incident_id = ?2",
            params![resolved_at.to_rfc3339(), incident_id],
        )?;
        Ok(())
    }

    pub fn open_escalation(&self) -> Result<Option<Incident>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT incident_id, series_key, source_id, kind, detected_at, resolved_at, detail \
             FROM incidents WHERE kind = 'escalation' AND resolved_at IS NULL \
             ORDER BY detected_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row([], row_to_incident)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    pub fn get_incidents(&self, since: DateTime<Utc>) -> Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT incident_id, series_key, source_id, kind, detected_at, resolved_at, detail \
             FROM incidents WHERE detected_at >= ?1 ORDER BY detected_at DESC",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], row_to_incident)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn kind_str(kind: IncidentKind) -> &'static str {
    match kind {
        IncidentKind::FetchFail => "fetch_fail",
        IncidentKind::ValidationFail => "validation_fail",
        IncidentKind::Stale => "stale",
        IncidentKind::CoverageDegraded => "coverage_degraded",
        IncidentKind::Escalation => "escalation",
    }
}

fn kind_from_str(s: &str) -> IncidentKind {
    match s {
        "fetch_fail" => IncidentKind::FetchFail,
        "validation_fail" => IncidentKind::ValidationFail,
        "stale" => IncidentKind::Stale,
        "coverage_degraded" => IncidentKind::CoverageDegraded,
        _ => IncidentKind::Escalation,
    }
}

fn row_to_observation(row: &rusqlite::Row) -> rusqlite::Result<Observation> {
    let timestamp: String = row.get(1)?;
    let fetch_time: String = row.get(12)?;
    let flags: u8 = row.get(13)?;
    Ok(Observation {
        series_key: row.get(0)?,
        timestamp: parse_rfc3339(&timestamp),
        value: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
        change_abs: row.get(8)?,
        change_pct: row.get(9)?,
        unit: row.get(10)?,
        source_id: row.get(11)?,
        fetch_time: parse_rfc3339(&fetch_time),
        validation_flags: ValidationFlags(flags),
    })
}

fn row_to_incident(row: &rusqlite::Row) -> rusqlite::Result<Incident> {
    let series_key: Option<String> = row.get(1)?;
    let source_id: Option<String> = row.get(2)?;
    let kind: String = row.get(3)?;
    let detected_at: String = row.get(4)?;
    let resolved_at: Option<String> = row.get(5)?;

    let target = match (series_key, source_id) {
        (Some(series_key), _) => IncidentTarget::Series { series_key },
        (None, Some(source_id)) => IncidentTarget::Source { source_id },
        (None, None) => IncidentTarget::Global,
    };

    Ok(Incident {
        incident_id: row.get(0)?,
        target,
        kind: kind_from_str(&kind),
        detected_at: parse_rfc3339(&detected_at),
        resolved_at: resolved_at.map(|s| parse_rfc3339(&s)),
        detail: row.get(6)?,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
