//! Rate and resource control: per-plugin token buckets, global I/O caps, and
//! the retry policy applied to transient external failures.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoffBuilder;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_PLUGIN_RATE: u32 = 10;

/// External-query failure taxonomy. Only transient failures are retried.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient failure: {0:#}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent failure: {0:#}")]
    Permanent(#[source] anyhow::Error),
    #[error("fetch interrupted by shutdown")]
    Canceled,
}

impl FetchError {
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let error = anyhow::anyhow!("{context}: HTTP {status}");

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            FetchError::Transient(error)
        } else {
            FetchError::Permanent(error)
        }
    }

    pub fn from_reqwest(error: reqwest::Error, context: &str) -> Self {
        if let Some(status) = error.status() {
            return Self::from_status(status, context);
        }

        let error = anyhow::Error::new(error).context(context.to_owned());

        // No HTTP status means the request never completed (connect failure,
        // timeout, truncated body). All of those are worth retrying.
        FetchError::Transient(error)
    }
}

/// Slackless token bucket: `rate` tokens per second, burst of one.
pub struct PluginLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    rate: u32,
}

impl PluginLimiter {
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1);
        let quota = Quota::per_second(NonZeroU32::new(rate).expect("rate clamped to at least 1"));

        Self {
            limiter: RateLimiter::direct(quota),
            rate,
        }
    }

    /// Suspends the caller until a token is available.
    pub async fn take(&self) {
        self.limiter.until_ready().await;
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

/// Retry with exponential backoff and jitter, capped by `max_retries`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails permanently, or exhausts the retry
    /// budget. Transient errors sleep `base * 2^k` plus jitter between
    /// attempts.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(FetchError::Transient(error)) => {
                    attempts += 1;

                    if attempts > self.max_retries {
                        return Err(FetchError::Transient(error.context("retry budget exhausted")));
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.base);
                    debug!(attempt = attempts, ?delay, error = format!("{error:#}"), "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(terminal) => return Err(terminal),
            }
        }
    }
}

/// Global concurrency caps shared by every plugin.
///
/// The semaphores double as quiescence probes: the engine is I/O-idle when
/// both are fully replenished.
pub struct IoBudget {
    http: Arc<Semaphore>,
    http_max: usize,
    dns: Arc<Semaphore>,
    dns_max: usize,
}

impl IoBudget {
    pub fn new(max_concurrent_http: usize, max_concurrent_dns: usize) -> Self {
        Self {
            http: Arc::new(Semaphore::new(max_concurrent_http)),
            http_max: max_concurrent_http,
            dns: Arc::new(Semaphore::new(max_concurrent_dns)),
            dns_max: max_concurrent_dns,
        }
    }

    pub async fn http_permit(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.http)
            .acquire_owned()
            .await
            .expect("HTTP semaphore is never closed")
    }

    pub async fn dns_permit(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.dns)
            .acquire_owned()
            .await
            .expect("DNS semaphore is never closed")
    }

    pub fn idle(&self) -> bool {
        self.http.available_permits() == self.http_max && self.dns.available_permits() == self.dns_max
    }
}

/// Token-bucket table, one bucket per plugin, lazily built from configured
/// rate overrides.
#[derive(Default)]
pub struct RatePolicy {
    overrides: RwLock<HashMap<SmolStr, u32>>,
    limiters: RwLock<HashMap<SmolStr, Arc<PluginLimiter>>>,
}

impl RatePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rate(&self, plugin: impl Into<SmolStr>, rate: u32) {
        self.overrides.write().insert(plugin.into(), rate);
    }

    pub fn limiter(&self, plugin: &str) -> Arc<PluginLimiter> {
        if let Some(limiter) = self.limiters.read().get(plugin) {
            return Arc::clone(limiter);
        }

        let rate = self.overrides.read().get(plugin).copied().unwrap_or(DEFAULT_PLUGIN_RATE);

        let mut limiters = self.limiters.write();
        Arc::clone(
            limiters
                .entry(plugin.into())
                .or_insert_with(|| Arc::new(PluginLimiter::new(rate))),
        )
    }
}
