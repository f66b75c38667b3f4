//! Error taxonomy folding every leaf crate's narrow error type into the
//! eight kinds from spec.md §7. Mirrors how `web3_proxy::errors::Web3ProxyError`
//! folds in `RedisPoolError`, `DbErr`, etc. via `#[from]` — this workspace
//! uses `thiserror` rather than the teacher's `derive_more` since there is
//! no `axum::IntoResponse` need here (see DESIGN.md).

use rpc_fallback::AllEndpointsFailed;
use serde::Serialize;
use thiserror::Error;

use crate::ports::PortError;
use crate::redact::redact_sensitive;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    RateLimit(#[from] token_bucket::RateLimitError),

    /// Never constructed outside `circuit-breaker`/`rpc-fallback`; surfaced
    /// here only so callers have one taxonomy to match on.
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    BulkheadFull(#[from] BulkheadFullMarker),

    #[error("bulkhead queue wait exceeded deadline")]
    BulkheadQueueTimeout,

    #[error(transparent)]
    AllEndpointsFailed(#[from] AllEndpointsFailed),

    #[error("upstream error: {0}")]
    Upstream(#[source] anyhow::Error),
}

/// `bulkhead::BulkheadError` covers three distinct conditions (`QueueFull`,
/// `QueueTimeout`, `QueueCleared`); only the full-queue case maps to
/// `AccessError::BulkheadFull`; the other two are classified explicitly in
/// `From<bulkhead::BulkheadError>` below rather than via a blanket `#[from]`.
#[derive(Debug, Error)]
#[error("bulkhead queue is full")]
pub struct BulkheadFullMarker;

impl From<bulkhead::BulkheadError> for AccessError {
    fn from(err: bulkhead::BulkheadError) -> Self {
        match err {
            bulkhead::BulkheadError::QueueFull => AccessError::BulkheadFull(BulkheadFullMarker),
            bulkhead::BulkheadError::QueueTimeout => AccessError::BulkheadQueueTimeout,
            bulkhead::BulkheadError::QueueCleared => AccessError::Timeout,
        }
    }
}

impl From<PortError> for AccessError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Validation(msg) => AccessError::Validation(msg),
            PortError::Upstream(msg) => AccessError::Upstream(anyhow::anyhow!(msg)),
        }
    }
}

impl<E: std::fmt::Display> From<circuit_breaker::BreakerError<E>> for AccessError {
    fn from(err: circuit_breaker::BreakerError<E>) -> Self {
        match err {
            circuit_breaker::BreakerError::Open => AccessError::CircuitOpen,
            circuit_breaker::BreakerError::Upstream(e) => AccessError::Upstream(anyhow::anyhow!(e.to_string())),
        }
    }
}

impl Clone for AccessError {
    fn clone(&self) -> Self {
        match self {
            Self::Validation(msg) => Self::Validation(msg.clone()),
            Self::RateLimit(e) => Self::RateLimit(e.clone()),
            Self::CircuitOpen => Self::CircuitOpen,
            Self::Timeout => Self::Timeout,
            Self::BulkheadFull(_) => Self::BulkheadFull(BulkheadFullMarker),
            Self::BulkheadQueueTimeout => Self::BulkheadQueueTimeout,
            Self::AllEndpointsFailed(e) => Self::AllEndpointsFailed(e.clone()),
            Self::Upstream(e) => Self::Upstream(anyhow::anyhow!(e.to_string())),
        }
    }
}

impl AccessError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimit(_) => "rate_limit",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::BulkheadFull(_) => "bulkhead_full",
            Self::BulkheadQueueTimeout => "bulkhead_queue_timeout",
            Self::AllEndpointsFailed(_) => "all_endpoints_failed",
            Self::Upstream(_) => "upstream",
        }
    }

    /// JSON view of this error with any field whose key matches the
    /// sensitive-field list (`apiKey`, `secret`, `password`, ...) replaced
    /// by a fixed sentinel, per spec.md §7 "Sensitive data". This is the
    /// only way an `AccessError` payload should leave the process, whether
    /// logged or handed back to a caller.
    pub fn to_redacted_json(&self) -> serde_json::Value {
        let mut payload = match self {
            Self::AllEndpointsFailed(e) => serde_json::json!({
                "kind": self.kind(),
                "message": self.to_string(),
                "chain": &*e.chain,
                "errors": e.errors.iter().map(|attempt| serde_json::json!({
                    "endpoint": &*attempt.endpoint,
                    "provider": &*attempt.provider,
                    "message": attempt.message,
                })).collect::<Vec<_>>(),
            }),
            _ => serde_json::json!({
                "kind": self.kind(),
                "message": self.to_string(),
            }),
        };
        redact_sensitive(&mut payload);
        payload
    }

    /// Logs this error as one structured `tracing` event carrying the
    /// redacted JSON payload — the entry point façade call sites use
    /// instead of logging `self.to_string()` (or a `Debug` payload) directly.
    pub fn log(&self) {
        tracing::warn!(error = %self.to_redacted_json(), "access layer error");
    }
}

impl Serialize for AccessError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_redacted_json().serialize(serializer)
    }
}
