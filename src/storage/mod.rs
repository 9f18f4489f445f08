//! Two-tier storage: hot cache (fast, short-TTL) in front of a durable
//! time-series store. The durable store is the single writer of record;
//! the hot store is a read accelerator that may lag by at most one write.

pub mod durable;
pub mod hot;

use crate::model::{CorrelationSnapshot, CycleReport, Incident, Observation, SeriesCategory, SeriesDescriptor};
use anyhow::Result;
use chrono::{DateTime, Utc};
use durable::{DurableStore, InsertOutcome};
use hot::HotCache;
use parking_lot::Mutex as PLMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Duplicate,
}

pub struct Storage {
    hot: HotCache,
    durable: DurableStore,
    /// One mutex per series_key, created on first use. Held for the
    /// duration of a series' durable-insert-then-hot-CAS write so two
    /// concurrent writers for the same series (a scheduled cycle racing an
    /// on-demand `fetch_now`) can never interleave their writes.
    series_locks: PLMutex<HashMap<String, Arc<PLMutex<()>>>>,
}

impl Storage {
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self {
            hot: HotCache::new(),
            durable: DurableStore::open(db_path)?,
            series_locks: PLMutex::new(HashMap::new()),
        })
    }

    fn series_lock(&self, series_key: &str) -> Arc<PLMutex<()>> {
        let mut locks = self.series_locks.lock();
        locks.entry(series_key.to_string()).or_insert_with(|| Arc::new(PLMutex::new(()))).clone()
    }

    /// Write path: durable store first, hot store updated only if the new
    /// timestamp strictly exceeds the current latest. The whole operation
    /// is serialized per series_key so the hot-store compare-and-set can't
    /// race a concurrent write for the same series.
    pub fn write_observation(
        &self,
        obs: &Observation,
        category: SeriesCategory,
        descriptor: &SeriesDescriptor,
    ) -> Result<WriteOutcome> {
        let lock = self.series_lock(&obs.series_key);
        let _guard = lock.lock();

        let outcome = match self.durable.insert_observation(obs, category) {
            Ok(o) => o,
            Err(e) => {
                warn!(series_key = %obs.series_key, error = %e, "durable write failed, retrying once");
                self.durable.insert_observation(obs, category)?
            }
        };

        let ttl = (descriptor.refresh_period * 2).max(hot::LATEST_MIN_TTL);
        self.hot
            .compare_and_set(&hot::latest_key(&obs.series_key), obs.timestamp, serde_json::to_value(obs)?, ttl);

        Ok(match outcome {
            InsertOutcome::Inserted => WriteOutcome::Written,
            InsertOutcome::Duplicate => WriteOutcome::Duplicate,
        })
    }

    /// Read path: prefer hot; on miss, read durable and backfill the hot key.
    pub fn get_latest(&self, series_key: &str, category: SeriesCategory, descriptor: &SeriesDescriptor) -> Result<Option<Observation>> {
        if let Some(v) = self.hot.get(&hot::latest_key(series_key)) {
            if let Ok(obs) = serde_json::from_value::<Observation>(v) {
                return Ok(Some(obs));
            }
        }

        let row = self.durable.get_latest(series_key, category)?;
        if let Some(obs) = &row {
            let ttl = (descriptor.refresh_period * 2).max(hot::LATEST_MIN_TTL);
            self.hot.put(hot::latest_key(series_key), serde_json::to_value(obs)?, Some(ttl));
        }
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
        self.durable.get_range(series_key, category, from, to, limit)
    }

    pub fn put_series_meta(&self, series_key: &str, descriptor: &SeriesDescriptor) -> Result<()> {
        self.hot
            .put(hot::series_meta_key(series_key), serde_json::to_value(descriptor)?, None);
        Ok(())
    }

    pub fn put_cycle_report(&self, report: &CycleReport) -> Result<()> {
        self.hot.put(
            hot::CYCLE_LAST_KEY,
            serde_json::to_value(report)?,
            Some(Duration::from_secs(3600)),
        );
        Ok(())
    }

    pub fn get_cycle_report(&self) -> Option<CycleReport> {
        self.hot
            .get(hot::CYCLE_LAST_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn put_correlation_snapshot(&self, snapshot: &CorrelationSnapshot) -> Result<()> {
        self.hot.put(
            hot::correlations_key(&snapshot.window),
            serde_json::to_value(snapshot)?,
            Some(Duration::from_secs(3600)),
        );
        Ok(())
    }

    pub fn get_correlation_snapshot(&self, window: &str) -> Option<CorrelationSnapshot> {
        self.hot
            .get(&hot::correlations_key(window))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn record_incident(&self, incident: &Incident) -> Result<()> {
        self.durable.record_incident(incident)
    }

    pub fn resolve_incident(&self, incident_id: &str) -> Result<()> {
        self.durable.resolve_incident(incident_id, Utc::now())
    }

    pub fn open_escalation(&self) -> Result<Option<Incident>> {
        self.durable.open_escalation()
    }

    pub fn get_incidents(&self, since: DateTime<Utc>) -> Result<Vec<Incident>> {
        self.durable.get_incidents(since)
    }

    pub fn sweep_hot_cache(&self) {
        self.hot.sweep_expired();
    }
}
