//! Market regime narrative: a coarse classification derived from a small
//! set of cross-asset signals. Never fabricates a regime when its inputs
//! are missing — returns the missing `series_key`s instead.

use crate::config::Config;
use crate::context::SystemContext;
use chrono::Utc;
use serde::Serialize;

/// Series this classification needs. Any series absent from the
/// configured catalog, or without a fresh observation, makes the
/// narrative "insufficient data" rather than a guess.
const REQUIRED_INPUTS: &[&str] = &["SPY", "VIX", "DGS10"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    RiskOn,
    RiskOff,
    FlightToSafety,
    Consolidation,
    Transition,
}

pub struct Narrative {
    pub regime: Regime,
    pub confidence: f64,
    pub inputs: Vec<String>,
}

pub enum NarrativeResult {
    Ok(Narrative),
    InsufficientData(Vec<String>),
}

pub async fn compute(config: &Config, ctx: &SystemContext) -> NarrativeResult {
    let mut missing = Vec::new();
    let mut equity_change_pct = None;
    let mut vol_level = None;
    let mut rate_level = None;

    for key in REQUIRED_INPUTS {
        let Some(descriptor) = config.series.get(*key) else {
            missing.push(key.to_string());
            continue;
        };
        let obs = match ctx.storage.get_latest(key, descriptor.category, descriptor) {
            Ok(Some(obs)) => obs,
            _ => {
                missing.push(key.to_string());
                continue;
            }
        };
        let age = Utc::now().signed_duration_since(obs.timestamp);
        let max_staleness = chrono::Duration::from_std(descriptor.max_staleness).unwrap_or(chrono::Duration::zero());
        if age > max_staleness * 2 {
            missing.push(key.to_string());
            continue;
        }

        match *key {
            "SPY" => equity_change_pct = obs.change_pct.or(Some(0.0)),
            "VIX" => vol_level = Some(obs.value),
            "DGS10" => rate_level = Some(obs.value),
            _ => {}
        }
    }

    if !missing.is_empty() {
        return NarrativeResult::InsufficientData(missing);
    }

    let equity = equity_change_pct.unwrap_or(0.0);
    let vol = vol_level.unwrap_or(0.0);

    let regime = classify(equity, vol);
    let confidence = confidence_for(equity, vol);

    NarrativeResult::Ok(Narrative {
        regime,
        confidence,
        inputs: REQUIRED_INPUTS.iter().map(|s| s.to_string()).collect(),
    })
}

/// Thresholds are a deliberately simple heuristic, not a calibrated model:
/// elevated volatility with a falling equity tape reads as risk-off or
/// flight-to-safety; low volatility with a rising tape reads as risk-on;
/// anything in between is consolidation or transition.
fn classify(equity_change_pct: f64, vol_level: f64) -> Regime {
    const VOL_HIGH: f64 = 25.0;
    const VOL_ELEVATED: f64 = 18.0;
    const MOVE_THRESHOLD: f64 = 0.5;

    if vol_level >= VOL_HIGH && equity_change_pct <= -MOVE_THRESHOLD {
        Regime::FlightToSafety
    } else if vol_level >= VOL_ELEVATED && equity_change_pct < 0.0 {
        Regime::RiskOff
    } else if vol_level < VOL_ELEVATED && equity_change_pct >= MOVE_THRESHOLD {
        Regime::RiskOn
    } else if equity_change_pct.abs() < MOVE_THRESHOLD {
        Regime::Consolidation
    } else {
        Regime::Transition
    }
}

fn confidence_for(equity_change_pct: f64, vol_level: f64) -> f64 {
    let move_strength = (equity_change_pct.abs() / 2.0).min(1.0);
    let vol_strength = (vol_level / 35.0).min(1.0);
    ((move_strength + vol_strength) / 2.0).clamp(0.0, 1.0)
}
