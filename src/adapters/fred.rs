//! FRED-style economic series adapter: API key passed in the query string.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Instant;

pub struct FredAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    query_name: String,
}

impl FredAdapter {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>, query_name: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            query_name,
        }
    }
}

#[async_trait]
impl SourceAdapter for FredAdapter {
    fn source_id(&self) -> &str {
        "fred"
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
            FetchHint::Range(_, _) => 5000,
        };

        with_deadline(deadline, self.fetch_observations(series_key, api_key, limit)).await
    }
}

impl FredAdapter {
    async fn fetch_observations(
        &self,
        series_key: &str,
        api_key: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, AdapterError> {
        let url = format!("{}/series/observations", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("series_id", series_key),
                (self.query_name.as_str(), api_key),
                ("file_type", "json"),
                ("sort_order", "desc"),
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

        let rows = body
            .get("observations")
            .and_then(|v| v.as_array())
            .ok_or(AdapterError::UpstreamEmpty)?;

        if rows.is_empty() {
            return Err(AdapterError::UpstreamEmpty);
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(date_str) = row.get("date").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(value_str) = row.get("value").and_then(|v| v.as_str()) else {
                continue;
            };
            // FRED marks missing days as literal "." — not a fabricated zero.
            if value_str == "." {
                continue;
            }
            let Ok(value) = value_str.parse::<f64>() else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            let ts = date
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_local_timezone(chrono::Utc)
                .single()
                .unwrap();

            out.push(Observation::new(series_key, ts, value, self.source_id()));
        }

        if out.is_empty() {
            return Err(AdapterError::UpstreamMalformed(
                "no usable observation rows".to_string(),
            ));
        }

        Ok(out)
    }
}
