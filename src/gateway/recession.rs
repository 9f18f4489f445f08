//! Recession-probability composite: a term-spread heuristic over the
//! 10-year/3-month treasury spread. Not a calibrated econometric model — a
//! simplified probit-style mapping chosen to approximate the textbook
//! Estrella-Mishkin relationship between an inverted curve and recession
//! risk closely enough for a dashboard composite (see DESIGN.md).

use crate::context::SystemContext;
use serde::Serialize;

const LONG_RATE_SERIES: &str = "DGS10";
const SHORT_RATE_SERIES: &str = "DTB3";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    Elevated,
    High,
    Critical,
}

pub struct RecessionComposite {
    pub spread_10y_3m: f64,
    pub probability: f64,
    pub risk_level: RiskLevel,
}

pub enum RecessionResult {
    Ok(RecessionComposite),
    InsufficientData(Vec<String>),
}

pub async fn compute(ctx: &SystemContext) -> RecessionResult {
    let mut missing = Vec::new();

    let long_rate = read_value(ctx, LONG_RATE_SERIES, &mut missing);
    let short_rate = read_value(ctx, SHORT_RATE_SERIES, &mut missing);

    if !missing.is_empty() {
        return RecessionResult::InsufficientData(missing);
    }

    let spread = long_rate.unwrap() - short_rate.unwrap();
    let probability = probability_from_spread(spread);
    let risk_level = risk_level_for(probability);

    RecessionResult::Ok(RecessionComposite {
        spread_10y_3m: spread,
        probability,
        risk_level,
    })
}

fn read_value(ctx: &SystemContext, series_key: &str, missing: &mut Vec<String>) -> Option<f64> {
    let descriptor = ctx.config.series.get(series_key);
    let Some(descriptor) = descriptor else {
        missing.push(series_key.to_string());
        return None;
    };
    match ctx.storage.get_latest(series_key, descriptor.category, descriptor) {
        Ok(Some(obs)) => Some(obs.value),
        _ => {
            missing.push(series_key.to_string());
            None
        }
    }
}

fn probability_from_spread(spread: f64) -> f64 {
    const A: f64 = -0.5;
    const B: f64 = -0.4;
    let z = A + B * spread;
    1.0 / (1.0 + (-z).exp())
}

fn risk_level_for(probability: f64) -> RiskLevel {
    if probability < 0.15 {
        RiskLevel::Low
    } else if probability < 0.30 {
        RiskLevel::Moderate
    } else if probability < 0.45 {
        RiskLevel::Elevated
    } else if probability < 0.65 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}
