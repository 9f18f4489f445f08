//! Health & Self-Heal Monitor: periodically classifies series freshness,
//! aggregates coverage, and emits a single idempotent ESCALATION signal
//! when the data plane crosses a degradation threshold.
//!
//! Generalizes a consecutive-failure tripwire from one hardcoded switch
//! per source to a per-series tick counter driven entirely by configured
//! descriptors.

use crate::config::Config;
use crate::model::{Incident, IncidentKind, IncidentTarget};
use crate::storage::Storage;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesHealth {
    Ok,
    Warn,
    Fail,
}

pub struct MonitorTickReport {
    pub coverage_pct: f64,
    pub series_health: HashMap<String, SeriesHealth>,
    pub escalated: bool,
}

pub struct Monitor {
    config: Arc<Config>,
    storage: Arc<Storage>,
    critical_fail_streak: Mutex<HashMap<String, u32>>,
}

impl Monitor {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> Self {
        Self {
            config,
            storage,
            critical_fail_streak: Mutex::new(HashMap::new()),
        }
    }

    pub fn tick(&self) -> MonitorTickReport {
        let now = Utc::now();
        let mut series_health = HashMap::with_capacity(self.config.series.len());
        let mut critical_fail_now = Vec::new();

        for series_key in &self.config.series_order {
            let descriptor = &self.config.series[series_key];
            let latest = self.storage.get_latest(series_key, descriptor.category, descriptor).ok().flatten();

            let health = match latest {
                None => SeriesHealth::Fail,
                Some(obs) => {
                    let age = now.signed_duration_since(obs.timestamp);
                    let max_staleness = chrono::Duration::from_std(descriptor.max_staleness).unwrap_or(chrono::Duration::zero());
                    if age <= max_staleness {
                        SeriesHealth::Ok
                    } else if age <= max_staleness * 2 {
                        SeriesHealth::Warn
                    } else {
                        SeriesHealth::Fail
                    }
                }
            };

            if descriptor.critical && health == SeriesHealth::Fail {
                critical_fail_now.push(series_key.clone());
            }

            series_health.insert(series_key.clone(), health);
        }

        let total = series_health.len().max(1);
        let ok_count = series_health.values().filter(|h| **h == SeriesHealth::Ok).count();
        let coverage_pct = ok_count as f64 / total as f64;

        let mut streak = self.critical_fail_streak.lock();
        let mut critical_breach = false;
        for series_key in &self.config.series_order {
            let descriptor = &self.config.series[series_key];
            if !descriptor.critical {
                continue;
            }
            let entry = streak.entry(series_key.clone()).or_insert(0);
            if critical_fail_now.contains(series_key) {
                *entry += 1;
                if *entry >= 2 {
                    critical_breach = true;
                }
            } else {
                *entry = 0;
            }
        }
        drop(streak);

        let should_escalate = coverage_pct < self.config.escalation_coverage_threshold || critical_breach;

        let mut escalated = false;
        if should_escalate {
            escalated = self.escalate(coverage_pct, &series_health);
        } else {
            self.resolve_if_open();
        }

        MonitorTickReport {
            coverage_pct,
            series_health,
            escalated,
        }
    }

    /// Emits the ESCALATION signal, idempotently: a second call while an
    /// incident is already open is a no-op.
    fn escalate(&self, coverage_pct: f64, series_health: &HashMap<String, SeriesHealth>) -> bool {
        match self.storage.open_escalation() {
            Ok(Some(_)) => return false,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to check for open escalation");
                return false;
            }
        }

        let failing: Vec<&String> = series_health
            .iter()
            .filter(|(_, h)| **h == SeriesHealth::Fail)
            .map(|(k, _)| k)
            .collect();

        let incident = Incident::new(
            IncidentTarget::Global,
            IncidentKind::Escalation,
            format!("coverage {:.1}% below threshold, failing series: {:?}", coverage_pct * 100.0, failing),
        );

        if let Err(e) = self.storage.record_incident(&incident) {
            warn!(error = %e, "failed to record escalation incident");
            return false;
        }

        if let Err(e) = self.write_artifacts(&incident.incident_id, coverage_pct, series_health) {
            warn!(error = %e, "failed to write escalation artifacts");
        }

        warn!(incident_id = %incident.incident_id, coverage_pct, "ESCALATION raised");
        true
    }

    fn resolve_if_open(&self) {
        if let Ok(Some(incident)) = self.storage.open_escalation() {
            if let Err(e) = self.storage.resolve_incident(&incident.incident_id) {
                warn!(error = %e, "failed to resolve escalation incident");
            } else {
                info!(incident_id = %incident.incident_id, "ESCALATION resolved");
                let _ = std::fs::remove_file(self.flag_path());
            }
        }
    }

    fn flag_path(&self) -> PathBuf {
        PathBuf::from(&self.config.escalation_dir).join("ESCALATED")
    }

    fn diagnosis_path(&self) -> PathBuf {
        PathBuf::from(&self.config.escalation_dir).join("diagnosis.txt")
    }

    fn write_artifacts(&self, incident_id: &str, coverage_pct: f64, series_health: &HashMap<String, SeriesHealth>) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.escalation_dir)?;
        std::fs::write(self.flag_path(), incident_id)?;

        let mut doc = String::new();
        doc.push_str(&format!("ESCALATION {incident_id}\n"));
        doc.push_str(&format!("coverage: {:.1}%\n", coverage_pct * 100.0));
        doc.push_str("series health:\n");
        let mut keys: Vec<&String> = series_health.keys().collect();
        keys.sort();
        for key in keys {
            doc.push_str(&format!("  {key}: {:?}\n", series_health[key]));
        }
        std::fs::write(self.diagnosis_path(), doc)
    }
}
