//! Per-client-IP gateway rate limiting: a token bucket per IP, 429 on
//! exhaustion. Grounded directly on `middleware/rate_limit.rs`'s
//! `Arc<Mutex<HashMap<IpAddr, ...>>>` + axum middleware shape, with the
//! fixed-window counter swapped for this crate's continuous token bucket.

use crate::scheduler::token_bucket::TokenBucket;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct GatewayRateLimiter {
    requests_per_min: u32,
    buckets: Arc<Mutex<HashMap<IpAddr, Arc<TokenBucket>>>>,
}

impl GatewayRateLimiter {
    pub fn new(requests_per_min: u32) -> Self {
        Self {
            requests_per_min,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn bucket_for(&self, ip: IpAddr) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(ip)
            .or_insert_with(|| Arc::new(TokenBucket::new(self.requests_per_min, Duration::from_secs(60))))
            .clone()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<GatewayRateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let bucket = limiter.bucket_for(addr.ip());
    if bucket.try_acquire() {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_per_ip_independently() {
        let limiter = GatewayRateLimiter::new(1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();

        assert!(limiter.bucket_for(a).try_acquire());
        assert!(!limiter.bucket_for(a).try_acquire());
        assert!(limiter.bucket_for(b).try_acquire());
    }
}
