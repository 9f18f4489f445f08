//! Core data model: Observation, descriptors, incidents, cycle reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One measurement at one point in time for one series.
///
/// Invariant: `(series_key, timestamp)` is unique in durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub series_key: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub change_abs: Option<f64>,
    pub change_pct: Option<f64>,
    pub unit: Option<String>,
    pub source_id: String,
    pub fetch_time: DateTime<Utc>,
    #[serde(default)]
    pub validation_flags: ValidationFlags,
}

impl Observation {
    pub fn new(series_key: impl Into<String>, timestamp: DateTime<Utc>, value: f64, source_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            series_key: series_key.into(),
            timestamp,
            value,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            change_abs: None,
            change_pct: None,
            unit: None,
            source_id: source_id.into(),
            fetch_time: now,
            validation_flags: ValidationFlags::empty(),
        }
    }
}

/// Bitset of flags attached to an accepted Observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationFlags(pub u8);

impl ValidationFlags {
    pub const STALE: ValidationFlags = ValidationFlags(1 << 0);
    pub const DUPLICATE: ValidationFlags = ValidationFlags(1 << 1);
    pub const BYPASS: ValidationFlags = ValidationFlags(1 << 2);

    pub const fn empty() -> Self {
        ValidationFlags(0)
    }

    pub fn set(&mut self, flag: ValidationFlags) {
        self.0 |= flag.0;
    }

    pub fn contains(&self, flag: ValidationFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: ValidationFlags) -> Self {
        ValidationFlags(self.0 | other.0)
    }
}

/// Category of a series, from its Series Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesCategory {
    Index,
    Commodity,
    Crypto,
    Forex,
    Treasury,
    Volatility,
    Economic,
    Sector,
    Custom,
}

impl SeriesCategory {
    /// Table name in the durable store for this category.
    pub fn table_name(&self) -> &'static str {
        match self {
            SeriesCategory::Index => "obs_indices",
            SeriesCategory::Commodity => "obs_commodities",
            SeriesCategory::Crypto => "obs_crypto",
            SeriesCategory::Forex => "obs_forex",
            SeriesCategory::Treasury => "obs_treasuries",
            SeriesCategory::Volatility => "obs_volatility",
            SeriesCategory::Economic => "obs_economic",
            SeriesCategory::Sector => "obs_sectors",
            SeriesCategory::Custom => "obs_custom",
        }
    }

    /// Minimum retention for this category.
    pub fn min_retention(&self) -> Duration {
        match self {
            SeriesCategory::Economic => Duration::from_secs(5 * 365 * 24 * 3600),
            _ => Duration::from_secs(30 * 24 * 3600),
        }
    }

    pub fn all() -> &'static [SeriesCategory] {
        &[
            SeriesCategory::Index,
            SeriesCategory::Commodity,
            SeriesCategory::Crypto,
            SeriesCategory::Forex,
            SeriesCategory::Treasury,
            SeriesCategory::Volatility,
            SeriesCategory::Economic,
            SeriesCategory::Sector,
            SeriesCategory::Custom,
        ]
    }
}

/// How an adapter authenticates against its upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKeyHeader { header_name: String, env_var: String },
    ApiKeyQuery { query_name: String, env_var: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Free,
    Paid,
}

/// Immutable, config-loaded metadata about one external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub base_url: String,
    pub auth_mode: AuthMode,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub request_timeout: Duration,
    pub cost_class: CostClass,
    pub supported_categories: Vec<SeriesCategory>,
    /// Max number of concurrent in-flight requests to this source.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

/// Immutable, config-loaded metadata about one series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    pub series_key: String,
    pub name: String,
    pub category: SeriesCategory,
    pub preferred_adapters: Vec<String>,
    pub max_staleness: Duration,
    pub sanity_lo: Option<f64>,
    pub sanity_hi: Option<f64>,
    pub refresh_period: Duration,
    #[serde(default)]
    pub critical: bool,
}

impl SeriesDescriptor {
    pub fn in_range(&self, value: f64) -> bool {
        if let Some(lo) = self.sanity_lo {
            if value < lo {
                return false;
            }
        }
        if let Some(hi) = self.sanity_hi {
            if value > hi {
                return false;
            }
        }
        true
    }
}

/// What the caller is actually asking an adapter for.
#[derive(Debug, Clone, Copy)]
pub enum FetchHint {
    Latest,
    LastN(usize),
    Range(DateTime<Utc>, DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    FetchFail,
    ValidationFail,
    Stale,
    CoverageDegraded,
    Escalation,
}

/// Target of an Incident: a series, a source, or the whole system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentTarget {
    Series { series_key: String },
    Source { source_id: String },
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub target: IncidentTarget,
    pub kind: IncidentKind,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub detail: String,
}

impl Incident {
    pub fn new(target: IncidentTarget, kind: IncidentKind, detail: impl Into<String>) -> Self {
        Self {
            incident_id: uuid::Uuid::new_v4().to_string(),
            target,
            kind,
            detected_at: Utc::now(),
            resolved_at: None,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesAttemptResult {
    Ok,
    FallbackOk,
    Fail,
}

/// One pass of the scheduler over all due series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub attempts: HashMap<String, SeriesAttemptResult>,
    pub failed_series: Vec<String>,
    pub success_rate: f64,
    pub critical_coverage_ok: bool,
    pub bypass: bool,
}

impl CycleReport {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            start,
            end: None,
            attempts: HashMap::new(),
            failed_series: Vec::new(),
            success_rate: 0.0,
            critical_coverage_ok: true,
            bypass: false,
        }
    }

    pub fn finish(&mut self, critical_series: &[String]) {
        self.end = Some(Utc::now());
        let total = self.attempts.len().max(1);
        let ok = self
            .attempts
            .values()
            .filter(|r| matches!(r, SeriesAttemptResult::Ok | SeriesAttemptResult::FallbackOk))
            .count();
        self.success_rate = ok as f64 / total as f64;
        self.failed_series = self
            .attempts
            .iter()
            .filter(|(_, r)| matches!(r, SeriesAttemptResult::Fail))
            .map(|(k, _)| k.clone())
            .collect();
        self.critical_coverage_ok = critical_series
            .iter()
            .all(|key| !matches!(self.attempts.get(key), Some(SeriesAttemptResult::Fail)));
    }
}

/// Derived, cached Pearson correlation matrix over a configured universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSnapshot {
    pub window: String,
    pub assets: Vec<String>,
    pub matrix: Vec<Vec<Option<f64>>>,
    pub computed_at: DateTime<Utc>,
}

/// Tolerant numeric deserializer: upstream payloads mix strings and numbers.
pub fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) => Ok(s.parse::<f64>().ok()),
        _ => Ok(None),
    }
}
