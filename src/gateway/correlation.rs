//! Pearson correlation matrix over a configured asset universe, computed
//! from recent Observation history and cached.

use crate::config::Config;
use crate::model::CorrelationSnapshot;
use crate::storage::Storage;
use chrono::Utc;

/// Upper bound on how many observations feed the estimate even for a long
/// window, so a `?window=365d` request doesn't drag in an unbounded amount
/// of history; the `from` bound below is what actually parameterizes the
/// window, this just caps the query size.
const MAX_SAMPLE_SIZE: usize = 2000;

/// Parses a window like `"7d"`/`"60d"`/`"365d"` into a day count. Defaults
/// to 60 only for a malformed value, never silently for an absent one —
/// the gateway handler is responsible for requiring the parameter.
fn parse_window_days(window: &str) -> i64 {
    let digits: String = window.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().unwrap_or(60).max(2)
}

pub fn compute(config: &Config, storage: &Storage, window: &str) -> CorrelationSnapshot {
    let assets = &config.correlation_assets;
    let now = Utc::now();
    let days = parse_window_days(window);
    let from = now - chrono::Duration::days(days);
    let sample_size = (days as usize).min(MAX_SAMPLE_SIZE);

    let series: Vec<Vec<f64>> = assets
        .iter()
        .map(|key| {
            config
                .series
                .get(key)
                .map(|descriptor| {
                    storage
                        .get_range(key, descriptor.category, from, now, Some(sample_size))
                        .unwrap_or_default()
                        .into_iter()
                        .map(|obs| obs.value)
                        .collect::<Vec<f64>>()
                })
                .unwrap_or_default()
        })
        .collect();

    let n = assets.len();
    let mut matrix = vec![vec![None; n]; n];
    for i in 0..n {
        matrix[i][i] = Some(1.0);
        for j in (i + 1)..n {
            let r = pearson(&series[i], &series[j]);
            matrix[i][j] = r;
            matrix[j][i] = r;
        }
    }

    CorrelationSnapshot {
        window: window.to_string(),
        assets: assets.clone(),
        matrix,
        computed_at: now,
    }
}

/// Returns `None` when there isn't enough overlapping history to form a
/// meaningful estimate, never a fabricated 0.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }

    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfectly_correlated_series_give_one() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 4.0, 6.0, 8.0, 10.0];
        assert_eq!(pearson(&a, &b), Some(1.0));
    }

    #[test]
    fn perfectly_anticorrelated_series_give_minus_one() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![5.0, 4.0, 3.0, 2.0, 1.0];
        assert_eq!(pearson(&a, &b), Some(-1.0));
    }

    #[test]
    fn insufficient_history_gives_none() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[], &[]), None);
    }

    #[test]
    fn zero_variance_series_gives_none() {
        let a = vec![5.0, 5.0, 5.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(pearson(&a, &b), None);
    }

    #[test]
    fn parses_window_day_counts() {
        assert_eq!(parse_window_days("7d"), 7);
        assert_eq!(parse_window_days("60d"), 60);
        assert_eq!(parse_window_days("365d"), 365);
        assert_eq!(parse_window_days("bogus"), 60);
        assert_eq!(parse_window_days("1d"), 2, "clamped to a minimum of 2 points");
    }
}
