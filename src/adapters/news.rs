//! Public news-headline adapter: API key passed as a header.
//!
//! Grounded on `scrapers/dome_rest.rs`'s header-auth client, adapted to
//! build the header per-request rather than bake it into the client, since
//! a missing key here must surface as `AdapterError::AuthFailed` rather
//! than fail the whole client's construction.

use super::{classify_reqwest_error, classify_status, with_deadline, AdapterError, SourceAdapter};
use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Instant;

pub struct NewsAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    header_name: String,
}

impl NewsAdapter {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>, header_name: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            header_name,
        }
    }
}

#[async_trait]
impl SourceAdapter for NewsAdapter {
    fn source_id(&self) -> &str {
        "news"
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

        let Some(api_key) = self.api_key.as_deref() else {
            return Err(AdapterError::AuthFailed);
        };

        with_deadline(deadline, self.fetch_headline(series_key, api_key)).await
    }
}

impl NewsAdapter {
    async fn fetch_headline(&self, series_key: &str, api_key: &str) -> Result<Vec<Observation>, AdapterError> {
        let header_name: reqwest::header::HeaderName = self
            .header_name
            .parse()
            .map_err(|_| AdapterError::UpstreamMalformed("invalid header name in config".to_string()))?;
        let header_value: reqwest::header::HeaderValue = api_key
            .parse()
            .map_err(|_| AdapterError::AuthFailed)?;

        let url = format!("{}/headlines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header(header_name, header_value)
            .query(&[("topic", series_key)])
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

        let articles = body
            .get("articles")
            .and_then(|v| v.as_array())
            .ok_or(AdapterError::UpstreamEmpty)?;

        let top = articles.first().ok_or(AdapterError::UpstreamEmpty)?;

        // A news "value" is a sentiment score when upstream provides one,
        // and an article count otherwise — treated as a scalar observation
        // like any other series.
        let value = top
            .get("sentiment")
            .and_then(|v| v.as_f64())
            .unwrap_or(articles.len() as f64);

        let ts = top
            .get("publishedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(vec![Observation::new(series_key, ts, value, self.source_id())])
    }
}
