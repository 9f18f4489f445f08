//! Fetch Scheduler: drives periodic refresh cycles and on-demand
//! `fetch_now` calls, enforcing per-source concurrency and rate limits with
//! an ordered adapter fallback chain per series.

pub mod token_bucket;

use crate::adapters::{AdapterError, SourceAdapter};
use crate::config::Config;
use crate::model::{
    CycleReport, FetchHint, Incident, IncidentKind, IncidentTarget, Observation, SeriesAttemptResult,
};
use crate::storage::{Storage, WriteOutcome};
use crate::validator::{validate, ValidationOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    Unavailable,
    ServiceBusy,
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Unavailable => write!(f, "UNAVAILABLE"),
            SchedulerError::ServiceBusy => write!(f, "SERVICE_BUSY"),
        }
    }
}

/// Per-series fast-retry state for CRITICAL series: two consecutive fails
/// shorten the next attempt window to min(refresh_period, 60s) for up to
/// three attempts, then back off.
struct RetryState {
    consecutive_fails: u32,
    fast_retries_used: u32,
}

pub struct Scheduler {
    config: Arc<Config>,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    storage: Arc<Storage>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    buckets: HashMap<String, Arc<token_bucket::TokenBucket>>,
    worker_pool: Arc<Semaphore>,
    next_due: Mutex<HashMap<String, chrono::DateTime<chrono::Utc>>>,
    retry_state: Mutex<HashMap<String, RetryState>>,
    queue_depth: AtomicUsize,
    high_water_mark: usize,
    last_cycle_end_unix_ms: AtomicI64,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, adapters: HashMap<String, Arc<dyn SourceAdapter>>, storage: Arc<Storage>) -> Self {
        let mut semaphores = HashMap::new();
        let mut buckets = HashMap::new();
        for (source_id, descriptor) in &config.sources {
            semaphores.insert(source_id.clone(), Arc::new(Semaphore::new(descriptor.concurrency.max(1))));
            buckets.insert(
                source_id.clone(),
                Arc::new(token_bucket::TokenBucket::new(descriptor.rate_limit_requests, descriptor.rate_limit_window)),
            );
        }

        let worker_pool_size = config.worker_pool_size;
        let series_per_cycle = config.series.len().max(1);
        let high_water_mark = 2 * worker_pool_size.max(1) * series_per_cycle;

        Self {
            config,
            adapters,
            storage,
            semaphores,
            buckets,
            worker_pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            next_due: Mutex::new(HashMap::new()),
            retry_state: Mutex::new(HashMap::new()),
            queue_depth: AtomicUsize::new(0),
            high_water_mark,
            last_cycle_end_unix_ms: AtomicI64::new(0),
        }
    }

    /// Runs one refresh cycle over all due series, optionally restricted to
    /// a category filter.
    pub async fn run_cycle(self: &Arc<Self>, category_filter: Option<crate::model::SeriesCategory>) -> CycleReport {
        let start = chrono::Utc::now();
        let mut report = CycleReport::new(start);
        report.bypass = self.config.skip_validation;

        let cycle_budget = Duration::from_secs(120);
        let deadline = Instant::now() + cycle_budget;
        let now = chrono::Utc::now();

        let due: Vec<String> = {
            let next_due = self.next_due.lock();
            self.config
                .series_order
                .iter()
                .filter(|key| {
                    let descriptor = &self.config.series[*key];
                    if let Some(filter) = category_filter {
                        if descriptor.category != filter {
                            return false;
                        }
                    }
                    next_due.get(*key).map(|due_at| *due_at <= now).unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        let mut handles = Vec::with_capacity(due.len());
        for series_key in due {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let result = this.attempt_series(&series_key, FetchHint::Latest, deadline).await;
                (series_key, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((series_key, Ok(_))) => {
                    report.attempts.insert(series_key.clone(), SeriesAttemptResult::Ok);
                    self.schedule_next(&series_key, true);
                }
                Ok((series_key, Err(_))) => {
                    report.attempts.insert(series_key.clone(), SeriesAttemptResult::Fail);
                    self.schedule_next(&series_key, false);
                }
                Err(e) => {
                    warn!(error = %e, "series task panicked or was cancelled");
                }
            }
        }

        let critical_series: Vec<String> = self
            .config
            .series_order
            .iter()
            .filter(|key| self.config.series[*key].critical)
            .cloned()
            .collect();
        report.finish(&critical_series);
        self.last_cycle_end_unix_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        if let Err(e) = self.storage.put_cycle_report(&report) {
            warn!(error = %e, "failed to persist cycle report");
        }
        info!(cycle_id = %report.cycle_id, success_rate = report.success_rate, "cycle complete");
        report
    }

    /// Synchronous on-demand fetch used by the Read Gateway.
    pub async fn fetch_now(self: &Arc<Self>, series_key: &str, timeout: Duration) -> Result<Observation, SchedulerError> {
        if self.queue_depth.load(Ordering::Relaxed) >= self.high_water_mark {
            return Err(SchedulerError::ServiceBusy);
        }

        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let result = self.attempt_series(series_key, FetchHint::Latest, deadline).await;
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);

        result.map_err(|_| SchedulerError::Unavailable)
    }

    fn schedule_next(&self, series_key: &str, ok: bool) {
        let Some(descriptor) = self.config.series.get(series_key) else {
            return;
        };
        let mut retry_state = self.retry_state.lock();
        let entry = retry_state.entry(series_key.to_string()).or_insert(RetryState {
            consecutive_fails: 0,
            fast_retries_used: 0,
        });

        let delay = if ok {
            entry.consecutive_fails = 0;
            entry.fast_retries_used = 0;
            descriptor.refresh_period
        } else {
            entry.consecutive_fails += 1;
            if descriptor.critical && entry.consecutive_fails >= 2 && entry.fast_retries_used < 3 {
                entry.fast_retries_used += 1;
                descriptor.refresh_period.min(Duration::from_secs(60))
            } else {
                descriptor.refresh_period
            }
        };

        let next = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.next_due.lock().insert(series_key.to_string(), next);
    }

    /// Try each configured adapter for a series in order, falling back on
    /// recoverable errors, validating every success before accepting it.
    async fn attempt_series(
        self: &Arc<Self>,
        series_key: &str,
        hint: FetchHint,
        deadline: Instant,
    ) -> Result<Observation, ()> {
        let Some(descriptor) = self.config.series.get(series_key).cloned() else {
            return Err(());
        };

        for source_id in &descriptor.preferred_adapters {
            if Instant::now() >= deadline {
                break;
            }

            let Some(adapter) = self.adapters.get(source_id) else {
                continue;
            };
            let Some(bucket) = self.buckets.get(source_id) else {
                continue;
            };
            let Some(semaphore) = self.semaphores.get(source_id) else {
                continue;
            };

            if !bucket.try_acquire() {
                continue;
            }

            let Ok(_permit) = semaphore.clone().acquire_owned().await else {
                continue;
            };

            let per_source_timeout = self.config.sources.get(source_id).map(|s| s.request_timeout).unwrap_or(Duration::from_secs(5));
            let attempt_deadline = deadline.min(Instant::now() + per_source_timeout);

            let fetch_result = adapter.fetch(series_key, hint, attempt_deadline).await;

            match fetch_result {
                Err(err) => {
                    if !err.is_silent_fallback() {
                        self.record_incident(
                            IncidentTarget::Source { source_id: source_id.clone() },
                            IncidentKind::FetchFail,
                            format!("{source_id} failed for {series_key}: {err}"),
                        );
                    }
                    continue;
                }
                Ok(mut observations) => {
                    if observations.is_empty() {
                        continue;
                    }
                    // Write in timestamp order: the per-observation latest-pointer
                    // compare-and-set only needs a strictly-greater timestamp to
                    // win, but ordering the writes this way keeps the durable
                    // table's append order matching series time, not fetch order.
                    observations.sort_by_key(|o| o.timestamp);

                    let known_sources: Vec<String> = self.config.sources.keys().cloned().collect();
                    let mut accepted: Vec<Observation> = Vec::new();
                    for obs in observations {
                        match validate(obs, &descriptor, &known_sources, chrono::Utc::now(), self.config.skip_validation) {
                            ValidationOutcome::Accepted(obs) => accepted.push(obs),
                            ValidationOutcome::Rejected(reason) => {
                                self.record_incident(
                                    IncidentTarget::Series { series_key: series_key.to_string() },
                                    IncidentKind::ValidationFail,
                                    format!("{source_id} rejected for {series_key}: {reason}"),
                                );
                            }
                        }
                    }

                    if accepted.is_empty() {
                        continue;
                    }

                    // Every accepted observation is persisted to the durable
                    // time-series table; only the one with the greatest
                    // timestamp can end up as `latest` (write_observation
                    // enforces that per call).
                    let mut storage_failed = false;
                    let mut newest: Option<Observation> = None;
                    for obs in accepted {
                        match self.storage.write_observation(&obs, descriptor.category, &descriptor) {
                            Ok(_) => {
                                if newest.as_ref().map(|n| obs.timestamp > n.timestamp).unwrap_or(true) {
                                    newest = Some(obs);
                                }
                            }
                            Err(e) => {
                                warn!(series_key, error = %e, "storage write failed after retry");
                                self.record_incident(
                                    IncidentTarget::Series { series_key: series_key.to_string() },
                                    IncidentKind::FetchFail,
                                    "storage",
                                );
                                storage_failed = true;
                            }
                        }
                    }

                    match newest {
                        Some(obs) => return Ok(obs),
                        None if storage_failed => continue,
                        None => continue,
                    }
                }
            }
        }

        Err(())
    }

    fn record_incident(&self, target: IncidentTarget, kind: IncidentKind, detail: impl Into<String>) {
        let incident = Incident::new(target, kind, detail);
        if let Err(e) = self.storage.record_incident(&incident) {
            warn!(error = %e, "failed to persist incident");
        }
    }
}

#[async_trait::async_trait]
impl crate::context::FetchRequester for Scheduler {
    async fn fetch_now(self: Arc<Self>, series_key: &str, timeout: Duration) -> Result<Observation, SchedulerError> {
        Scheduler::fetch_now(&self, series_key, timeout).await
    }
}
