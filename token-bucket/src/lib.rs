//! Per-endpoint token-bucket rate limiting.
//!
//! One [`TokenBucket`] admits requests for a single endpoint URL. Buckets
//! are created lazily and cheaply by a [`TokenBucketRegistry`] keyed by a
//! canonical endpoint string, mirroring how `deferred-rate-limiter` keeps a
//! `moka` cache of per-key limiter state instead of provisioning every
//! limiter up front.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How often the waiter queue is drained when nothing else wakes it.
///
/// Spec treats this as an implementation detail, not an observable
/// contract; only FIFO order and `maxWaitMs` are guaranteed.
const DRAIN_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone)]
#[error("rate limit exceeded for {limiter} (max wait {period:?})")]
pub struct RateLimitError {
    pub limiter: Arc<str>,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub max_wait: Duration,
}

impl TokenBucketConfig {
    pub fn from_rps(rps: f64, max_wait: Duration) -> Self {
        Self {
            capacity: rps,
            refill_per_sec: rps,
            max_wait,
        }
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::from_rps(10.0, Duration::from_secs(5))
    }
}

struct Waiter {
    deadline: Instant,
    tx: oneshot::Sender<Result<(), RateLimitError>>,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    draining: bool,
}

impl Inner {
    fn refill(&mut self, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token-bucket limiter for a single endpoint.
pub struct TokenBucket {
    name: Arc<str>,
    config: TokenBucketConfig,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(name: impl Into<Arc<str>>, config: TokenBucketConfig) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            name,
            config,
            inner: Mutex::new(Inner {
                tokens: config.capacity,
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
                draining: false,
            }),
        })
    }

    /// Consume a token if one is available right now, without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        inner.refill(self.config.capacity, self.config.refill_per_sec);
        if inner.waiters.is_empty() && inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refill and report the current token count, without consuming.
    pub fn available(self: &Arc<Self>) -> u64 {
        let mut inner = self.inner.lock();
        inner.refill(self.config.capacity, self.config.refill_per_sec);
        inner.tokens.floor().max(0.0) as u64
    }

    /// Wait until a token is consumed, or fail after `max_wait`.
    pub async fn acquire(self: &Arc<Self>) -> Result<(), RateLimitError> {
        if self.try_acquire() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.max_wait;

        {
            let mut inner = self.inner.lock();
            inner.waiters.push_back(Waiter { deadline, tx });
            if !inner.draining {
                inner.draining = true;
                self.spawn_drain_task();
            }
        }

        trace!(limiter = %self.name, "waiting for token");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError {
                limiter: self.name.clone(),
                period: self.config.max_wait,
            }),
        }
    }

    fn spawn_drain_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_TICK);
            loop {
                tick.tick().await;

                let mut inner = this.inner.lock();
                inner.refill(this.config.capacity, this.config.refill_per_sec);
                let now = Instant::now();

                while let Some(front) = inner.waiters.front() {
                    if front.deadline <= now {
                        let waiter = inner.waiters.pop_front().expect("front checked above");
                        warn!(limiter = %this.name, "waiter exceeded max wait");
                        let _ = waiter.tx.send(Err(RateLimitError {
                            limiter: this.name.clone(),
                            period: this.config.max_wait,
                        }));
                    } else {
                        break;
                    }
                }

                while inner.tokens >= 1.0 {
                    match inner.waiters.pop_front() {
                        Some(waiter) => {
                            inner.tokens -= 1.0;
                            debug!(limiter = %this.name, "granted queued waiter");
                            let _ = waiter.tx.send(Ok(()));
                        }
                        None => break,
                    }
                }

                if inner.waiters.is_empty() {
                    inner.draining = false;
                    break;
                }
            }
        });
    }
}

/// Lazily-created per-endpoint bucket pool, living for the lifetime of the
/// enclosing chain.
#[derive(Clone)]
pub struct TokenBucketRegistry {
    default_config: TokenBucketConfig,
    buckets: Cache<Arc<str>, Arc<TokenBucket>>,
}

impl TokenBucketRegistry {
    pub fn new(default_config: TokenBucketConfig) -> Self {
        Self {
            default_config,
            buckets: Cache::builder().build(),
        }
    }

    /// Get or lazily create the bucket for `key` (typically an endpoint URL).
    pub async fn get_or_create(&self, key: &str, config: Option<TokenBucketConfig>) -> Arc<TokenBucket> {
        let key: Arc<str> = Arc::from(key);
        let config = config.unwrap_or(self.default_config);
        self.buckets
            .get_with(key.clone(), async move { TokenBucket::new(key, config) })
            .await
    }
}
