//! Generic forex-rate adapter: public spot-rate endpoint, no key.
//!
//! Series keys are 6-letter pairs like "EURUSD" (base + quote), split into
//! the upstream's `base`/`symbols` query parameters.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::time::Instant;

pub struct ForexAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl ForexAdapter {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SourceAdapter for ForexAdapter {
    fn source_id(&self) -> &str {
        "forex"
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

        let (base_ccy, quote_ccy) = split_pair(series_key).ok_or(AdapterError::NotSupported)?;
        with_deadline(deadline, self.fetch_rate(series_key, base_ccy, quote_ccy)).await
    }
}

impl ForexAdapter {
    async fn fetch_rate(
        &self,
        series_key: &str,
        base_ccy: &str,
        quote_ccy: &str,
    ) -> Result<Vec<Observation>, AdapterError> {
        let url = format!("{}/latest", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("base", base_ccy), ("symbols", quote_ccy)])
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

        let rate = body
            .get("rates")
            .and_then(|r| r.get(quote_ccy))
            .and_then(|v| v.as_f64())
            .ok_or(AdapterError::UpstreamEmpty)?;

        let ts = body
            .get("date")
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| dt.and_local_timezone(Utc).single())
            .unwrap_or_else(Utc::now);

        let mut obs = Observation::new(series_key, ts, rate, self.source_id());
        obs.unit = Some(quote_ccy.to_string());
        Ok(vec![obs])
    }
}

/// Splits "EURUSD" into ("EUR", "USD"). Rejects anything not exactly two
/// 3-letter ISO codes concatenated.
fn split_pair(series_key: &str) -> Option<(&str, &str)> {
    if series_key.len() != 6 || !series_key.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(series_key.split_at(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_valid_pair() {
        assert_eq!(split_pair("EURUSD"), Some(("EUR", "USD")));
    }

    #[test]
    fn rejects_malformed_pair() {
        assert_eq!(split_pair("EUR-USD"), None);
        assert_eq!(split_pair("EU"), None);
    }
}
