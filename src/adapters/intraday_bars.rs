//! Generic intraday-bars adapter: API key passed in the query string.
//!
//! Grounded on the interval/rate-limit conventions in
//! `049c245e_dbrowne-alphavantage__..._intraday_price_loader.rs`
//! (`IntradayInterval`, `api_delay_ms`), adapted to this crate's uniform
//! `SourceAdapter` contract.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{de_f64_opt, FetchHint, Observation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Instant;

/// Bar interval this adapter requests from upstream. A fixed "1min" interval
/// keeps the adapter single-purpose; a coarser interval is a different
/// series, not a parameter of this one.
const INTERVAL: &str = "1min";

pub struct IntradayBarsAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    query_name: String,
}

impl IntradayBarsAdapter {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>, query_name: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            query_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Bar {
    #[serde(rename = "t")]
    time: DateTime<Utc>,
    #[serde(rename = "o", deserialize_with = "de_f64_opt", default)]
    open: Option<f64>,
    #[serde(rename = "h", deserialize_with = "de_f64_opt", default)]
    high: Option<f64>,
    #[serde(rename = "l", deserialize_with = "de_f64_opt", default)]
    low: Option<f64>,
    #[serde(rename = "c", deserialize_with = "de_f64_opt", default)]
    close: Option<f64>,
    #[serde(rename = "v", deserialize_with = "de_f64_opt", default)]
    volume: Option<f64>,
}

#[async_trait]
impl SourceAdapter for IntradayBarsAdapter {
    fn source_id(&self) -> &str {
        "intraday_bars"
    }

    async fn fetch(
        &self,
        series_key: &str,
        hint: FetchHint,
        deadline: Instant,
    ) -> Result<Vec<Observation>, AdapterError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AdapterError::AuthFailed);
        };

        let limit = match hint {
            FetchHint::Latest => 1,
            FetchHint::LastN(n) => n,
            FetchHint::Range(_, _) => 500,
        };

        with_deadline(deadline, self.fetch_bars(series_key, api_key, limit)).await
    }
}

impl IntradayBarsAdapter {
    async fn fetch_bars(
        &self,
        series_key: &str,
        api_key: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, AdapterError> {
        let url = format!("{}/bars", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", series_key),
                ("interval", INTERVAL),
                (self.query_name.as_str(), api_key),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::UpstreamMalformed(e.to_string()))?;

        let raw_bars = body
            .get("bars")
            .cloned()
            .ok_or(AdapterError::UpstreamEmpty)?;

        let bars: Vec<Bar> = serde_json::from_value(raw_bars)
            .map_err(|e| AdapterError::UpstreamMalformed(e.to_string()))?;

        if bars.is_empty() {
            return Err(AdapterError::UpstreamEmpty);
        }

        let mut out = Vec::with_capacity(bars.len());
        for bar in bars {
            let Some(close) = bar.close else { continue };
            let mut obs = Observation::new(series_key, bar.time, close, self.source_id());
            obs.open = bar.open;
            obs.high = bar.high;
            obs.low = bar.low;
            obs.close = bar.close;
            obs.volume = bar.volume;
            out.push(obs);
        }

        if out.is_empty() {
            return Err(AdapterError::UpstreamMalformed(
                "no bar had a usable close".to_string(),
            ));
        }

        Ok(out)
    }
}
