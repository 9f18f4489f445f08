//! Equity/ETF/index quote adapter: public retail-quote endpoint, no key.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use std::time::Instant;
use tracing::debug;

pub struct RetailQuoteAdapter {
    client: Client,
    base_url: String,
}

impl RetailQuoteAdapter {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SourceAdapter for RetailQuoteAdapter {
    fn source_id(&self) -> &str {
        "retail_quote"
    }

    async fn fetch(
        &self,
        series_key: &str,
        hint: FetchHint,
        deadline: Instant,
    ) -> Result<Vec<Observation>, AdapterError> {
        if !matches!(hint, FetchHint::Latest) {
            return Err(AdapterError::NotSupported);
        }

        with_deadline(deadline, self.fetch_latest(series_key)).await
    }
}

impl RetailQuoteAdapter {
    async fn fetch_latest(&self, series_key: &str) -> Result<Vec<Observation>, AdapterError> {
        let url = format!("{}/quote", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", series_key)])
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

        let payload = body
            .get("quote")
            .or(Some(&body))
            .ok_or(AdapterError::UpstreamEmpty)?;

        let close = payload
            .get("regularMarketPrice")
            .or_else(|| payload.get("price"))
            .or_else(|| payload.get("close"))
            .and_then(json_number);

        let Some(close) = close else {
            debug!(series_key, "retail_quote: upstream returned no price field");
            return Err(AdapterError::UpstreamEmpty);
        };

        let ts = payload
            .get("regularMarketTime")
            .or_else(|| payload.get("timestamp"))
            .and_then(json_number)
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Utc::now);

        let change_abs = payload.get("regularMarketChange").and_then(json_number);
        let change_pct = payload
            .get("regularMarketChangePercent")
            .or_else(|| payload.get("change_pct"))
            .and_then(json_number);

        let mut obs = Observation::new(series_key, ts, close, self.source_id());
        obs.close = Some(close);
        obs.change_abs = change_abs;
        obs.change_pct = change_pct;

        Ok(vec![obs])
    }
}

/// Upstream retail-quote JSON mixes numbers and numeric strings.
fn json_number(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_number_accepts_string_or_number() {
        assert_eq!(json_number(&serde_json::json!(668.81)), Some(668.81));
        assert_eq!(json_number(&serde_json::json!("668.81")), Some(668.81));
        assert_eq!(json_number(&serde_json::json!(null)), None);
    }
}
