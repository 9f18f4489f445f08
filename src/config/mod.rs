//! Declarative config loader: source catalog, series catalog, runtime knobs.
//!
//! Follows the same validated-raw-config-struct pattern used elsewhere in
//! this crate, but sources its structured content (sources/series) from a
//! YAML file instead of flat env vars.

use crate::model::{AuthMode, SeriesCategory, SeriesDescriptor, SourceDescriptor};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Wire shape for one series entry. `refresh_period` is optional here and
/// absent falls back to the config's category-level default (spec.md §4.B:
/// 900s default for price-class series, 3600s for macro-class/economic),
/// resolved in `Config::validate` where the global defaults are in scope.
#[derive(Debug, Clone, Deserialize)]
struct RawSeriesDescriptor {
    series_key: String,
    name: String,
    category: SeriesCategory,
    preferred_adapters: Vec<String>,
    max_staleness: Duration,
    sanity_lo: Option<f64>,
    sanity_hi: Option<f64>,
    #[serde(default)]
    refresh_period: Option<Duration>,
    #[serde(default)]
    critical: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_price_refresh_secs")]
    pub price_refresh_secs: u64,
    #[serde(default = "default_macro_refresh_secs")]
    pub macro_refresh_secs: u64,
    #[serde(default = "default_healthy_threshold")]
    pub cycle_healthy_threshold: f64,
    #[serde(default = "default_monitor_period_secs")]
    pub monitor_period_secs: u64,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    #[serde(default = "default_gateway_rate_limit")]
    pub gateway_rate_limit_per_min: u32,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_coverage_threshold: f64,
    #[serde(default = "default_escalation_dir")]
    pub escalation_dir: String,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: Option<usize>,
    /// Asset universe the correlations endpoint computes pairwise Pearson
    /// coefficients over. Defaults to every configured series.
    #[serde(default)]
    pub correlation_assets: Vec<String>,
    /// Durable-store connection string. Overridable via `--db-path` /
    /// `DATABASE_URL` at boot.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    pub sources: Vec<SourceDescriptor>,
    series: Vec<RawSeriesDescriptor>,
}

fn default_price_refresh_secs() -> u64 {
    900
}
fn default_macro_refresh_secs() -> u64 {
    3600
}
fn default_healthy_threshold() -> f64 {
    0.8
}
fn default_monitor_period_secs() -> u64 {
    60
}
fn default_gateway_port() -> u16 {
    3000
}
fn default_gateway_rate_limit() -> u32 {
    100
}
fn default_escalation_threshold() -> f64 {
    0.8
}
fn default_escalation_dir() -> String {
    "./escalation".to_string()
}
fn default_worker_pool_size() -> Option<usize> {
    None
}
fn default_db_path() -> String {
    "marketdata.db".to_string()
}

/// Validated, process-wide configuration. Immutable after boot.
#[derive(Debug, Clone)]
pub struct Config {
    pub price_refresh: Duration,
    pub macro_refresh: Duration,
    pub cycle_healthy_threshold: f64,
    pub monitor_period: Duration,
    pub gateway_port: u16,
    pub gateway_rate_limit_per_min: u32,
    pub skip_validation: bool,
    pub escalation_coverage_threshold: f64,
    pub escalation_dir: String,
    pub worker_pool_size: usize,
    pub db_path: String,
    pub sources: HashMap<String, SourceDescriptor>,
    pub series: HashMap<String, SeriesDescriptor>,
    pub series_order: Vec<String>,
    pub correlation_assets: Vec<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_yaml::from_str(yaml).context("failed to parse YAML config")?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self> {
        let price_refresh = Duration::from_secs(raw.price_refresh_secs);
        let macro_refresh = Duration::from_secs(raw.macro_refresh_secs);

        let mut sources = HashMap::with_capacity(raw.sources.len());
        for s in raw.sources {
            if sources.insert(s.source_id.clone(), s).is_some() {
                bail!("duplicate source_id in config");
            }
        }

        let mut series = HashMap::with_capacity(raw.series.len());
        let mut series_order = Vec::with_capacity(raw.series.len());
        for s in raw.series {
            if s.preferred_adapters.is_empty() {
                bail!(
                    "series '{}' has zero configured adapters",
                    s.series_key
                );
            }
            for adapter in &s.preferred_adapters {
                if !sources.contains_key(adapter) {
                    bail!(
                        "series '{}' references undeclared source '{}'",
                        s.series_key,
                        adapter
                    );
                }
            }
            if s.critical && s.preferred_adapters.len() < 2 {
                bail!(
                    "CRITICAL series '{}' must have at least 2 adapters",
                    s.series_key
                );
            }

            // spec.md §4.B: 900s default refresh for price-class series,
            // 3600s for macro-class (economic); either is overridable
            // per-series via an explicit `refresh_period`.
            let refresh_period = s.refresh_period.unwrap_or(match s.category {
                SeriesCategory::Economic => macro_refresh,
                _ => price_refresh,
            });

            let descriptor = SeriesDescriptor {
                series_key: s.series_key.clone(),
                name: s.name,
                category: s.category,
                preferred_adapters: s.preferred_adapters,
                max_staleness: s.max_staleness,
                sanity_lo: s.sanity_lo,
                sanity_hi: s.sanity_hi,
                refresh_period,
                critical: s.critical,
            };

            series_order.push(descriptor.series_key.clone());
            if series.insert(descriptor.series_key.clone(), descriptor).is_some() {
                bail!("duplicate series_key in config");
            }
        }

        let worker_pool_size = raw
            .worker_pool_size
            .unwrap_or_else(|| sources.len().max(1));

        let correlation_assets = if raw.correlation_assets.is_empty() {
            series_order.clone()
        } else {
            raw.correlation_assets
        };

        Ok(Config {
            price_refresh,
            macro_refresh,
            cycle_healthy_threshold: raw.cycle_healthy_threshold,
            monitor_period: Duration::from_secs(raw.monitor_period_secs),
            gateway_port: raw.gateway_port,
            gateway_rate_limit_per_min: raw.gateway_rate_limit_per_min,
            skip_validation: raw.skip_validation,
            escalation_coverage_threshold: raw.escalation_coverage_threshold,
            escalation_dir: raw.escalation_dir,
            worker_pool_size,
            db_path: raw.db_path,
            sources,
            series,
            series_order,
            correlation_assets,
        })
    }

    /// Resolve an env-var-backed credential for a source's auth mode.
    pub fn credential_for(&self, source_id: &str) -> Option<String> {
        let source = self.sources.get(source_id)?;
        match &source.auth_mode {
            AuthMode::None => None,
            AuthMode::ApiKeyHeader { env_var, .. } | AuthMode::ApiKeyQuery { env_var, .. } => {
                std::env::var(env_var).ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
sources:
  - source_id: retail_quote
    base_url: "https://example.invalid/quote"
    auth_mode:
      mode: none
    rate_limit_requests: 60
    rate_limit_window:
      secs: 60
      nanos: 0
    request_timeout:
      secs: 5
      nanos: 0
    cost_class: free
    supported_categories: [index]
  - source_id: intraday_bars
    base_url: "https://example.invalid/bars"
    auth_mode:
      mode: api_key_query
      query_name: apikey
      env_var: BARS_API_KEY
    rate_limit_requests: 5
    rate_limit_window:
      secs: 60
      nanos: 0
    request_timeout:
      secs: 5
      nanos: 0
    cost_class: paid
    supported_categories: [index]
series:
  - series_key: SPY
    name: "S&P 500 ETF"
    category: index
    preferred_adapters: [retail_quote, intraday_bars]
    max_staleness:
      secs: 3600
      nanos: 0
    sanity_lo: 1.0
    sanity_hi: null
    refresh_period:
      secs: 900
      nanos: 0
    critical: true
"#;

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse(MINIMAL_YAML).expect("should parse");
        assert_eq!(cfg.series.len(), 1);
        assert_eq!(cfg.sources.len(), 2);
        assert!(cfg.series["SPY"].critical);
    }

    #[test]
    fn omitted_refresh_period_falls_back_to_category_default() {
        let yaml = r#"
price_refresh_secs: 900
macro_refresh_secs: 3600
sources:
  - source_id: retail_quote
    base_url: "https://example.invalid/quote"
    auth_mode:
      mode: none
    rate_limit_requests: 60
    rate_limit_window: { secs: 60, nanos: 0 }
    request_timeout: { secs: 5, nanos: 0 }
    cost_class: free
    supported_categories: [index]
  - source_id: fred
    base_url: "https://example.invalid/fred"
    auth_mode:
      mode: api_key_query
      query_name: api_key
      env_var: FRED_API_KEY
    rate_limit_requests: 120
    rate_limit_window: { secs: 60, nanos: 0 }
    request_timeout: { secs: 5, nanos: 0 }
    cost_class: free
    supported_categories: [economic]
series:
  - series_key: SPY
    name: "S&P 500 ETF"
    category: index
    preferred_adapters: [retail_quote]
    max_staleness: { secs: 3600, nanos: 0 }
    sanity_lo: 1.0
    sanity_hi: null
    critical: false
  - series_key: DGS10
    name: "10-Year Treasury"
    category: economic
    preferred_adapters: [fred]
    max_staleness: { secs: 86400, nanos: 0 }
    sanity_lo: 0.0
    sanity_hi: null
    critical: false
"#;
        let cfg = Config::parse(yaml).expect("should parse");
        assert_eq!(cfg.series["SPY"].refresh_period, Duration::from_secs(900));
        assert_eq!(cfg.series["DGS10"].refresh_period, Duration::from_secs(3600));
    }

    #[test]
    fn rejects_zero_adapter_series() {
        let yaml = r#"
sources: []
series:
  - series_key: SPY
    name: "S&P 500 ETF"
    category: index
    preferred_adapters: []
    max_staleness: { secs: 3600, nanos: 0 }
    sanity_lo: 1.0
    sanity_hi: null
    refresh_period: { secs: 900, nanos: 0 }
    critical: false
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("zero configured adapters"));
    }

    #[test]
    fn rejects_undeclared_adapter_reference() {
        let yaml = r#"
sources: []
series:
  - series_key: SPY
    name: "S&P 500 ETF"
    category: index
    preferred_adapters: [nonexistent]
    max_staleness: { secs: 3600, nanos: 0 }
    sanity_lo: 1.0
    sanity_hi: null
    refresh_period: { secs: 900, nanos: 0 }
    critical: false
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared source"));
    }

    #[test]
    fn rejects_critical_series_with_one_adapter() {
        let yaml = MINIMAL_YAML.replace("preferred_adapters: [retail_quote, intraday_bars]", "preferred_adapters: [retail_quote]");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("CRITICAL series"));
    }
}
