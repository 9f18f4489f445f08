//! Hot store: short-TTL in-memory cache, keyed by
//! `latest:{series_key}` / `series:meta:{series_key}` / `cycle:last` /
//! `correlations:{window}` conventions.
//!
//! An `Arc<Mutex<...>>`-guarded shared-state cache, single-process, with no
//! external cache server.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// Minimum TTL for `latest:*` entries regardless of a series' refresh
/// period.
pub const LATEST_MIN_TTL: Duration = Duration::from_secs(15 * 60);

pub struct HotCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl HotCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: impl Into<String>, value: serde_json::Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.write().insert(key.into(), Entry { value, expires_at });
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Atomically replaces `key` with `value` iff no entry is present yet
    /// or the present entry's `"timestamp"` field is strictly less than
    /// `candidate_ts`. The read of the current timestamp and the write of
    /// the new value happen under the same write-lock acquisition, so a
    /// concurrent `compare_and_set` for the same key can never interleave
    /// between the compare and the set. Returns whether the value won.
    pub fn compare_and_set(&self, key: &str, candidate_ts: DateTime<Utc>, value: serde_json::Value, ttl: Duration) -> bool {
        let mut entries = self.entries.write();
        let current_ts = entries
            .get(key)
            .and_then(|entry| entry.value.get("timestamp"))
            .and_then(|t| t.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        if current_ts.map(|ts| candidate_ts > ts).unwrap_or(true) {
            entries.insert(key.to_string(), Entry { value, expires_at: Some(Instant::now() + ttl) });
            true
        } else {
            false
        }
    }

    /// Best-effort eviction sweep for keys that are not `latest:*` (those
    /// never expire proactively before TTL).
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .retain(|_, entry| entry.expires_at.map(|exp| exp > now).unwrap_or(true));
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new()
    }
}

pub fn latest_key(series_key: &str) -> String {
    format!("latest:{series_key}")
}

pub fn series_meta_key(series_key: &str) -> String {
    format!("series:meta:{series_key}")
}

pub const CYCLE_LAST_KEY: &str = "cycle:last";

pub fn correlations_key(window: &str) -> String {
    format!("correlations:{window}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn put_get_roundtrip() {
        let cache = HotCache::new();
        cache.put("latest:SPY", serde_json::json!({"value": 668.81}), None);
        let got = cache.get("latest:SPY").unwrap();
        assert_eq!(got["value"], 668.81);
    }

    #[test]
    fn expires_after_ttl() {
        let cache = HotCache::new();
        cache.put("cycle:last", serde_json::json!({"ok": true}), Some(Duration::from_millis(10)));
        sleep(Duration::from_millis(30));
        assert!(cache.get("cycle:last").is_none());
    }

    #[test]
    fn missing_key_is_none() {
        let cache = HotCache::new();
        assert!(cache.get("latest:NOPE").is_none());
    }

    #[test]
    fn compare_and_set_rejects_older_timestamp() {
        let cache = HotCache::new();
        let newer = Utc::now();
        let older = newer - chrono::Duration::minutes(5);

        assert!(cache.compare_and_set("latest:SPY", newer, serde_json::json!({"timestamp": newer, "value": 670.0}), LATEST_MIN_TTL));
        assert!(!cache.compare_and_set("latest:SPY", older, serde_json::json!({"timestamp": older, "value": 660.0}), LATEST_MIN_TTL));

        assert_eq!(cache.get("latest:SPY").unwrap()["value"], 670.0);
    }

    #[test]
    fn compare_and_set_accepts_first_write() {
        let cache = HotCache::new();
        let now = Utc::now();
        assert!(cache.compare_and_set("latest:SPY", now, serde_json::json!({"timestamp": now, "value": 668.81}), LATEST_MIN_TTL));
    }
}
