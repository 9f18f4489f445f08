//! HTTP handlers for the Read API Gateway.
//!
//! Every handler follows the same shape: read from Storage; on a miss or
//! unacceptable staleness, ask the scheduler for one on-demand fetch with a
//! tight deadline; if still unavailable, return a structured "missing"
//! body rather than fabricating a value.

use crate::context::SystemContext;
use crate::gateway::{correlation, narrative, recession};
use crate::scheduler::SchedulerError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const ON_DEMAND_DEADLINE: Duration = Duration::from_secs(3);

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_s: u64,
    pub cycle_last: Option<CycleLastView>,
    pub coverage_pct: f64,
}

#[derive(Serialize)]
pub struct CycleLastView {
    pub start: chrono::DateTime<Utc>,
    pub end: Option<chrono::DateTime<Utc>>,
    pub success_rate: f64,
    pub critical_ok: bool,
}

pub async fn health(State(ctx): State<SystemContext>) -> Json<HealthResponse> {
    let cycle = ctx.storage.get_cycle_report();
    let coverage_pct = cycle.as_ref().map(|c| c.success_rate).unwrap_or(0.0);
    let cycle_unhealthy = coverage_pct < ctx.config.cycle_healthy_threshold;
    Json(HealthResponse {
        status: if ctx.config.skip_validation || cycle_unhealthy { "degraded" } else { "ok" },
        uptime_s: ctx.uptime().as_secs(),
        cycle_last: cycle.map(|c| CycleLastView {
            start: c.start,
            end: c.end,
            success_rate: c.success_rate,
            critical_ok: c.critical_coverage_ok,
        }),
        coverage_pct,
    })
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum QuoteResponse {
    Found {
        series_key: String,
        timestamp: chrono::DateTime<Utc>,
        value: f64,
        change_abs: Option<f64>,
        change_pct: Option<f64>,
        change_pct_5d: Option<f64>,
        source_id: String,
        stale: bool,
        #[serde(skip_serializing_if = "is_false")]
        degraded: bool,
    },
    Missing {
        series_key: String,
        error: &'static str,
        missing: bool,
    },
}

pub async fn market_quote(
    State(ctx): State<SystemContext>,
    Path(series_key): Path<String>,
) -> Result<Json<QuoteResponse>, StatusCode> {
    let Some(descriptor) = ctx.config.series.get(&series_key).cloned() else {
        return Err(StatusCode::NOT_FOUND);
    };

    let latest = ctx
        .storage
        .get_latest(&series_key, descriptor.category, &descriptor)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let is_stale = |ts: chrono::DateTime<Utc>| {
        let age = Utc::now().signed_duration_since(ts);
        let max_staleness = chrono::Duration::from_std(descriptor.max_staleness).unwrap_or(chrono::Duration::zero());
        age > max_staleness
    };

    let observation = match latest {
        Some(obs) if !is_stale(obs.timestamp) => Some(obs),
        maybe_stale => {
            match Arc::clone(&ctx.fetch_requester).fetch_now(&series_key, ON_DEMAND_DEADLINE).await {
                Ok(fresh) => Some(fresh),
                Err(SchedulerError::ServiceBusy) => maybe_stale,
                Err(SchedulerError::Unavailable) => maybe_stale,
            }
        }
    };

    let Some(obs) = observation else {
        return Ok(Json(QuoteResponse::Missing {
            series_key,
            error: "UNAVAILABLE",
            missing: true,
        }));
    };

    let stale = is_stale(obs.timestamp);
    let change_pct_5d = five_day_change_pct(&ctx, &series_key, descriptor.category, obs.value);
    Ok(Json(QuoteResponse::Found {
        series_key,
        timestamp: obs.timestamp,
        value: obs.value,
        change_abs: obs.change_abs,
        change_pct: obs.change_pct,
        change_pct_5d,
        source_id: obs.source_id,
        stale,
        degraded: ctx.config.skip_validation,
    }))
}

/// Percent change from the oldest observation in the trailing 5-day window
/// to the current value. Best-effort: any storage error or empty window
/// yields `None` rather than failing the whole quote response.
fn five_day_change_pct(ctx: &SystemContext, series_key: &str, category: crate::model::SeriesCategory, current: f64) -> Option<f64> {
    let to = Utc::now();
    let from = to - chrono::Duration::days(5);
    let window = ctx.storage.get_range(series_key, category, from, to, None).ok()?;
    let baseline = window.into_iter().min_by_key(|o| o.timestamp)?;
    if baseline.value == 0.0 {
        return None;
    }
    Some((current - baseline.value) / baseline.value * 100.0)
}

#[derive(Deserialize)]
pub struct SymbolQuery {
    pub range: Option<String>,
    #[allow(dead_code)]
    pub interval: Option<String>,
}

pub async fn market_symbol(
    State(ctx): State<SystemContext>,
    Path(series_key): Path<String>,
    Query(query): Query<SymbolQuery>,
) -> Result<Json<Vec<crate::model::Observation>>, StatusCode> {
    let Some(descriptor) = ctx.config.series.get(&series_key) else {
        return Err(StatusCode::NOT_FOUND);
    };

    let days = parse_range_days(query.range.as_deref()).ok_or(StatusCode::BAD_REQUEST)?;
    let to = Utc::now();
    let from = to - chrono::Duration::days(days);

    let observations = ctx
        .storage
        .get_range(&series_key, descriptor.category, from, to, None)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(observations))
}

fn parse_range_days(range: Option<&str>) -> Option<i64> {
    let range = range.unwrap_or("30d");
    let digits: String = range.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

#[derive(Deserialize)]
pub struct EconomicQuery {
    pub limit: Option<usize>,
}

pub async fn economic_series(
    State(ctx): State<SystemContext>,
    Path(series_key): Path<String>,
    Query(query): Query<EconomicQuery>,
) -> Result<Json<Vec<crate::model::Observation>>, StatusCode> {
    let Some(descriptor) = ctx.config.series.get(&series_key) else {
        return Err(StatusCode::NOT_FOUND);
    };

    let limit = query.limit.unwrap_or(100);
    let to = Utc::now();
    let from = chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap();

    let observations = ctx
        .storage
        .get_range(&series_key, descriptor.category, from, to, Some(limit))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(observations))
}

#[derive(Deserialize)]
pub struct CorrelationsQuery {
    pub window: Option<String>,
}

pub async fn correlations(
    State(ctx): State<SystemContext>,
    Query(query): Query<CorrelationsQuery>,
) -> Result<Json<crate::model::CorrelationSnapshot>, StatusCode> {
    // spec.md treats `window` as an explicit request parameter with no
    // implied default — absence is a caller error, not a 60d fallback.
    let window = query.window.ok_or(StatusCode::BAD_REQUEST)?;
    if let Some(cached) = ctx.storage.get_correlation_snapshot(&window) {
        return Ok(Json(cached));
    }

    let snapshot = correlation::compute(&ctx.config, &ctx.storage, &window);
    let _ = ctx.storage.put_correlation_snapshot(&snapshot);
    Ok(Json(snapshot))
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum NarrativeResponse {
    Ok {
        regime: narrative::Regime,
        confidence: f64,
        inputs: Vec<String>,
        computed_at: chrono::DateTime<Utc>,
    },
    InsufficientData {
        error: &'static str,
        missing: Vec<String>,
    },
}

pub async fn market_narrative(State(ctx): State<SystemContext>) -> Json<NarrativeResponse> {
    match narrative::compute(&ctx.config, &ctx).await {
        narrative::NarrativeResult::Ok(result) => Json(NarrativeResponse::Ok {
            regime: result.regime,
            confidence: result.confidence,
            inputs: result.inputs,
            computed_at: Utc::now(),
        }),
        narrative::NarrativeResult::InsufficientData(missing) => {
            Json(NarrativeResponse::InsufficientData { error: "INSUFFICIENT_DATA", missing })
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum RecessionResponse {
    Ok {
        spread_10y_3m: f64,
        probability: f64,
        risk_level: recession::RiskLevel,
        computed_at: chrono::DateTime<Utc>,
    },
    InsufficientData {
        error: &'static str,
        missing: Vec<String>,
    },
}

pub async fn recession_probability(State(ctx): State<SystemContext>) -> Json<RecessionResponse> {
    match recession::compute(&ctx).await {
        recession::RecessionResult::Ok(composite) => Json(RecessionResponse::Ok {
            spread_10y_3m: composite.spread_10y_3m,
            probability: composite.probability,
            risk_level: composite.risk_level,
            computed_at: Utc::now(),
        }),
        recession::RecessionResult::InsufficientData(missing) => {
            Json(RecessionResponse::InsufficientData { error: "INSUFFICIENT_DATA", missing })
        }
    }
}

#[derive(Deserialize)]
pub struct IncidentsQuery {
    pub since: Option<chrono::DateTime<Utc>>,
}

pub async fn system_incidents(
    State(ctx): State<SystemContext>,
    Query(query): Query<IncidentsQuery>,
) -> Result<Json<Vec<crate::model::Incident>>, StatusCode> {
    let since = query.since.unwrap_or_else(|| Utc::now() - chrono::Duration::days(1));
    let incidents = ctx.storage.get_incidents(since).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(incidents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_day_range() {
        assert_eq!(parse_range_days(Some("90d")), Some(90));
        assert_eq!(parse_range_days(None), Some(30));
        assert_eq!(parse_range_days(Some("bogus")), None);
    }
}
