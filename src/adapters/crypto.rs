//! Public crypto market-data adapter: no key, high-frequency refresh.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::time::Instant;

pub struct CryptoAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl CryptoAdapter {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SourceAdapter for CryptoAdapter {
    fn source_id(&self) -> &str {
        "crypto"
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

        with_deadline(deadline, self.fetch_ticker(series_key)).await
    }
}

impl CryptoAdapter {
    async fn fetch_ticker(&self, series_key: &str) -> Result<Vec<Observation>, AdapterError> {
        let url = format!("{}/ticker", self.base_url);
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

        let price = body
            .get("price")
            .or_else(|| body.get("last"))
            .and_then(json_number)
            .ok_or(AdapterError::UpstreamEmpty)?;

        let volume = body.get("volume").and_then(json_number);

        let ts = body
            .get("closeTime")
            .or_else(|| body.get("timestamp"))
            .and_then(json_number)
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
            .unwrap_or_else(Utc::now);

        let mut obs = Observation::new(series_key, ts, price, self.source_id());
        obs.close = Some(price);
        obs.volume = volume;
        Ok(vec![obs])
    }
}

/// Crypto tickers are as likely to quote price as a string as a number.
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
        assert_eq!(json_number(&serde_json::json!(42123.5)), Some(42123.5));
        assert_eq!(json_number(&serde_json::json!("42123.5")), Some(42123.5));
    }
}
