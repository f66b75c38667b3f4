//! Per-(chain, provider) circuit breaker.
//!
//! Three states — CLOSED, OPEN, HALF_OPEN — gating whether an operation is
//! allowed to run at all. Grounded on the `CircuitBreaker` in
//! `resilient_client.rs`, generalized to the rolling-window failure count
//! spec.md calls for instead of a simple consecutive-failure counter.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Upstream(E),
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub volume_threshold: u32,
    pub rolling_window: Duration,
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            volume_threshold: failure_threshold,
            rolling_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

enum StateKind {
    Closed,
    Open { open_until: Instant },
    HalfOpen,
}

struct Inner {
    state: StateKind,
    /// (timestamp, is_failure), pruned to `rolling_window` on every decision.
    events: VecDeque<(Instant, bool)>,
    half_open_successes: u32,
    half_open_in_flight: bool,
}

/// A single provider's breaker.
pub struct Breaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: StateKind::Closed,
                events: VecDeque::new(),
                half_open_successes: 0,
                half_open_in_flight: false,
            }),
        })
    }

    fn prune(&self, inner: &mut Inner) {
        let cutoff = Instant::now().checked_sub(self.config.rolling_window);
        if let Some(cutoff) = cutoff {
            while let Some((ts, _)) = inner.events.front() {
                if *ts < cutoff {
                    inner.events.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Peek at whether the breaker is currently denying admission, without
    /// mutating state. Used by callers that want to silently route around
    /// an OPEN breaker rather than paying for a fail-fast `execute` call.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        matches!(inner.state, StateKind::Open { open_until } if Instant::now() < open_until)
    }

    pub fn state(&self) -> BreakerStateKind {
        let inner = self.inner.lock();
        match inner.state {
            StateKind::Closed => BreakerStateKind::Closed,
            StateKind::Open { .. } => BreakerStateKind::Open,
            StateKind::HalfOpen => BreakerStateKind::HalfOpen,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = StateKind::Closed;
        inner.events.clear();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = false;
    }

    /// Run `op` through the breaker. Errors raised by `op` propagate as
    /// [`BreakerError::Upstream`]; the breaker's own fail-fast is
    /// [`BreakerError::Open`].
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted = {
            let mut inner = self.inner.lock();
            self.prune(&mut inner);

            match inner.state {
                StateKind::Closed => true,
                StateKind::HalfOpen => {
                    if inner.half_open_in_flight {
                        false
                    } else {
                        inner.half_open_in_flight = true;
                        true
                    }
                }
                StateKind::Open { open_until } => {
                    if Instant::now() >= open_until {
                        debug!(breaker = %self.name, "transitioning to half-open");
                        inner.state = StateKind::HalfOpen;
                        inner.half_open_successes = 0;
                        inner.half_open_in_flight = true;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if !admitted {
            return Err(BreakerError::Open);
        }

        let result = op().await;

        {
            let mut inner = self.inner.lock();
            match &result {
                Ok(_) => self.on_success(&mut inner),
                Err(_) => self.on_failure(&mut inner),
            }
        }

        result.map_err(BreakerError::Upstream)
    }

    fn on_success(&self, inner: &mut Inner) {
        let now = Instant::now();
        inner.events.push_back((now, false));

        if matches!(inner.state, StateKind::HalfOpen) {
            inner.half_open_in_flight = false;
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                debug!(breaker = %self.name, "closing after consecutive successes");
                inner.state = StateKind::Closed;
                inner.events.clear();
                inner.half_open_successes = 0;
            }
        }
    }

    fn on_failure(&self, inner: &mut Inner) {
        let now = Instant::now();
        inner.events.push_back((now, true));

        match inner.state {
            StateKind::HalfOpen => {
                warn!(breaker = %self.name, "reopening after half-open failure");
                inner.half_open_in_flight = false;
                inner.state = StateKind::Open {
                    open_until: now + self.config.open_timeout,
                };
            }
            StateKind::Closed => {
                self.prune(inner);
                let failures = inner.events.iter().filter(|(_, f)| *f).count() as u32;
                let volume = inner.events.len() as u32;
                if failures >= self.config.failure_threshold && volume >= self.config.volume_threshold {
                    warn!(breaker = %self.name, failures, "opening circuit");
                    inner.state = StateKind::Open {
                        open_until: now + self.config.open_timeout,
                    };
                }
            }
            StateKind::Open { .. } => {}
        }
    }
}

/// Owns one [`Breaker`] per (chain, provider) key, created lazily.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<(Arc<str>, Arc<str>), Arc<Breaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, chain: &str, provider: &str) -> Arc<Breaker> {
        let key = (Arc::from(chain), Arc::from(provider));
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.clone())
            .or_insert_with(|| {
                let name: Arc<str> = Arc::from(format!("{}:{}", key.0, key.1));
                Breaker::new(name, self.default_config)
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<((Arc<str>, Arc<str>), BreakerStateKind)> {
        self.breakers
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() -> Result<(), &'static str> {
        Ok(())
    }

    async fn fail() -> Result<(), &'static str> {
        Err("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures_in_window() {
        let breaker = Breaker::new("p", BreakerConfig::new(2));

        assert!(breaker.execute(fail).await.is_err());
        assert_eq!(breaker.state(), BreakerStateKind::Closed);

        assert!(breaker.execute(fail).await.is_err());
        assert_eq!(breaker.state(), BreakerStateKind::Open);
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_timeout_elapses() {
        let mut cfg = BreakerConfig::new(1);
        cfg.open_timeout = Duration::from_secs(30);
        let breaker = Breaker::new("p", cfg);

        assert!(breaker.execute(fail).await.is_err());
        assert_eq!(breaker.state(), BreakerStateKind::Open);

        let result = breaker.execute(ok).await;
        assert!(matches!(result, Err(BreakerError::Open)));

        tokio::time::advance(Duration::from_secs(31)).await;

        let result = breaker.execute(ok).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe_and_closes_after_successes() {
        let mut cfg = BreakerConfig::new(1);
        cfg.success_threshold = 2;
        let breaker = Breaker::new("p", cfg);

        breaker.execute(fail).await.ok();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breaker.execute(ok).await.is_ok());
        assert_eq!(breaker.state(), BreakerStateKind::HalfOpen);

        assert!(breaker.execute(ok).await.is_ok());
        assert_eq!(breaker.state(), BreakerStateKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = Breaker::new("p", BreakerConfig::new(1));

        breaker.execute(fail).await.ok();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breaker.execute(fail).await.is_err());
        assert_eq!(breaker.state(), BreakerStateKind::Open);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = Breaker::new("p", BreakerConfig::new(1));
        breaker.execute(fail).await.ok();
        assert_eq!(breaker.state(), BreakerStateKind::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerStateKind::Closed);
        assert!(!breaker.is_open());
    }

    #[test]
    fn registry_reuses_breaker_per_chain_provider() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get_or_create("1", "alchemy");
        let b = registry.get_or_create("1", "alchemy");
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_or_create("1", "infura");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
