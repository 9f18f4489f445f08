//! Explicit system context: replaces ad-hoc global state with one struct
//! assembled at boot and passed to every component that needs it. Also
//! defines the `FetchRequester` capability that lets the gateway request
//! synchronous fetches without holding a reference back to the scheduler
//! (breaking the gateway↔scheduler cycle).

use crate::config::Config;
use crate::model::Observation;
use crate::scheduler::SchedulerError;
use crate::storage::Storage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant as TokioInstant;

/// Narrow capability the scheduler publishes and the gateway consumes.
/// The scheduler holds no reference to the gateway; only this trait object
/// flows the other way.
#[async_trait]
pub trait FetchRequester: Send + Sync {
    async fn fetch_now(self: Arc<Self>, series_key: &str, timeout: Duration) -> Result<Observation, SchedulerError>;
}

#[derive(Clone)]
pub struct SystemContext {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub fetch_requester: Arc<dyn FetchRequester>,
    pub boot_time: TokioInstant,
    /// Flips to true once the initial preload cycle completes. The gateway
    /// answers 503 for any request made before this point.
    ready: Arc<AtomicBool>,
}

impl SystemContext {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>, fetch_requester: Arc<dyn FetchRequester>) -> Self {
        Self {
            config,
            storage,
            fetch_requester,
            boot_time: TokioInstant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.boot_time.elapsed()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
