//! Source Adapter Set.
//!
//! Uniform contract: every adapter is a plain struct wrapping a shared
//! `reqwest::Client`, takes a series key + fetch hint + deadline, and
//! returns a finite (possibly empty) sequence of Observations tagged with
//! its own `source_id`. Adapters never invent values and never write to
//! storage; fallback across adapters is the scheduler's job, not theirs.

pub mod crypto;
pub mod forex;
pub mod fred;
pub mod intraday_bars;
pub mod news;
pub mod retail_quote;

use crate::model::{FetchHint, Observation};
use async_trait::async_trait;
use std::time::Instant;

/// Error kinds an adapter may surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    Timeout,
    RateLimited,
    AuthFailed,
    NotSupported,
    UpstreamEmpty,
    UpstreamMalformed(String),
    Network(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Timeout => write!(f, "TIMEOUT"),
            AdapterError::RateLimited => write!(f, "RATE_LIMITED"),
            AdapterError::AuthFailed => write!(f, "AUTH_FAILED"),
            AdapterError::NotSupported => write!(f, "NOT_SUPPORTED"),
            AdapterError::UpstreamEmpty => write!(f, "UPSTREAM_EMPTY"),
            AdapterError::UpstreamMalformed(d) => write!(f, "UPSTREAM_MALFORMED: {d}"),
            AdapterError::Network(d) => write!(f, "NETWORK: {d}"),
        }
    }
}

/// Does this error justify trying the next adapter in the fallback chain
/// silently (no Incident), or should the scheduler also record a
/// FETCH_FAIL incident?
impl AdapterError {
    pub fn is_silent_fallback(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout
                | AdapterError::Network(_)
                | AdapterError::RateLimited
                | AdapterError::UpstreamEmpty
        )
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        series_key: &str,
        hint: FetchHint,
        deadline: Instant,
    ) -> Result<Vec<Observation>, AdapterError>;
}

/// Runs `fut` but converts a deadline overrun into `AdapterError::Timeout`.
pub(crate) async fn with_deadline<T>(
    deadline: Instant,
    fut: impl std::future::Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout),
    }
}

/// Classifies a reqwest error the way every adapter in this set does.
pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else if err.is_connect() || err.is_request() {
        AdapterError::Network(err.to_string())
    } else {
        AdapterError::Network(err.to_string())
    }
}

/// Classifies an HTTP status code the way every adapter in this set does.
pub(crate) fn classify_status(status: reqwest::StatusCode) -> Option<AdapterError> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Some(AdapterError::RateLimited)
    } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Some(AdapterError::AuthFailed)
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Some(AdapterError::NotSupported)
    } else if !status.is_success() {
        Some(AdapterError::Network(format!("HTTP {status}")))
    } else {
        None
    }
}
