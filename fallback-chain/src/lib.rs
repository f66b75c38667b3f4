//! Generic ordered-try-until-success combinator.
//!
//! Not specific to RPC: anything that can be expressed as an ordered list of
//! named, optionally-guarded, optionally-timed-out strategies can be run
//! through a [`FallbackChain`]. The RPC fallback chain (in `rpc-fallback`)
//! is a richer, RPC-specific sibling of this; this crate is the
//! general-purpose combinator spec.md calls out separately in §4.3.
//!
//! Grounded on the composable-policy style of `tower-resilience` and the
//! retry-loop shape of hyperlane's `EthereumFallbackProvider::request`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

pub type StrategyFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// One named attempt in a [`FallbackChain`].
pub struct Strategy<T, E> {
    name: Arc<str>,
    execute: Box<dyn Fn() -> StrategyFuture<'static, T, E> + Send + Sync>,
    should_attempt: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    timeout: Option<Duration>,
}

impl<T, E> Strategy<T, E> {
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(move || Box::pin(execute())),
            should_attempt: None,
            timeout: None,
        }
    }

    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_attempt = Some(Box::new(guard));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A collected prior error: which strategy, and what it said.
#[derive(Debug, Clone)]
pub struct StrategyError {
    pub name: Arc<str>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    /// Winning strategy index, or `-1` if the chain's default value was used.
    pub index: i64,
    pub name: Option<Arc<str>>,
    pub errors: Vec<StrategyError>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum FallbackError {
    AllFailed(Vec<StrategyError>),
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackError::AllFailed(errors) => {
                let joined = errors
                    .iter()
                    .map(|e| format!("{}: {}", e.name, e.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "all strategies failed: {joined}")
            }
        }
    }
}

impl std::error::Error for FallbackError {}

/// Ordered-try-until-success combinator over a non-empty list of strategies.
pub struct FallbackChain<T, E> {
    strategies: Vec<Strategy<T, E>>,
    default: Option<T>,
}

impl<T, E> FallbackChain<T, E>
where
    T: Clone,
    E: fmt::Display,
{
    /// # Panics
    /// Panics if `strategies` is empty — the chain must have at least one
    /// strategy to try, per spec.
    pub fn new(strategies: Vec<Strategy<T, E>>) -> Self {
        assert!(!strategies.is_empty(), "fallback chain needs at least one strategy");
        Self {
            strategies,
            default: None,
        }
    }

    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    pub async fn execute(&self) -> Result<Outcome<T>, FallbackError> {
        let start = Instant::now();
        let mut errors = Vec::new();

        for (idx, strategy) in self.strategies.iter().enumerate() {
            if let Some(guard) = &strategy.should_attempt {
                if !guard() {
                    trace!(strategy = %strategy.name, "guard skipped strategy");
                    continue;
                }
            }

            let fut = (strategy.execute)();

            let result = match strategy.timeout {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(r) => r,
                    Err(_) => {
                        errors.push(StrategyError {
                            name: strategy.name.clone(),
                            message: "timed out".to_string(),
                        });
                        continue;
                    }
                },
                None => fut.await,
            };

            match result {
                Ok(value) => {
                    return Ok(Outcome {
                        value,
                        index: idx as i64,
                        name: Some(strategy.name.clone()),
                        errors,
                        elapsed: start.elapsed(),
                    });
                }
                Err(e) => {
                    errors.push(StrategyError {
                        name: strategy.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(default) = &self.default {
            return Ok(Outcome {
                value: default.clone(),
                index: -1,
                name: None,
                errors,
                elapsed: start.elapsed(),
            });
        }

        Err(FallbackError::AllFailed(errors))
    }
}
