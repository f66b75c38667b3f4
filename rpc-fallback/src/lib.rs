//! The RPC fallback chain: the densest component in this workspace.
//!
//! Given a per-chain ordered endpoint list and the shared breaker registry,
//! rate limiter registry, metrics store and an optional last-known-good
//! cache, executes a caller-supplied `op(endpoint_url) -> value` resiliently
//! — consulting the circuit breaker and rate limiter before every attempt,
//! retrying with capped exponential backoff, racing a hard wall-clock
//! deadline, and folding every endpoint's errors into one terminal
//! `AllEndpointsFailed`.
//!
//! Directly generalizes `web3_proxy::rpcs::request::OpenRequestHandle`: the
//! `op(endpoint_url)` closure stands in for `provider.request(method,
//! params)`, and endpoint/provider context is threaded onto every `tracing`
//! event the same way `OpenRequestHandle::request` attaches `rpc=%self.conn`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use circuit_breaker::{Breaker, BreakerConfig, BreakerError, BreakerRegistry, BreakerStateKind};
use parking_lot::Mutex;
use provider_metrics::{MetricsSnapshot, MetricsStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use token_bucket::{TokenBucketConfig, TokenBucketRegistry};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    WebSocket,
}

/// Immutable endpoint record. Endpoints are keyed by URL within a chain.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Arc<str>,
    pub provider: Arc<str>,
    /// Lower is higher priority.
    pub priority: u32,
    pub max_rps: f64,
    pub transport: TransportKind,
}

/// Chain id, display name, native-asset info and the endpoint list, sorted
/// once at construction by ascending priority (ties broken by insertion
/// order — `Vec::sort_by_key` is stable).
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: Arc<str>,
    pub display_name: Arc<str>,
    pub native_symbol: Arc<str>,
    pub decimals: u8,
    pub endpoints: Vec<Endpoint>,
    pub rps_hint: Option<f64>,
}

impl ChainConfig {
    pub fn new(
        chain_id: impl Into<Arc<str>>,
        display_name: impl Into<Arc<str>>,
        native_symbol: impl Into<Arc<str>>,
        decimals: u8,
        mut endpoints: Vec<Endpoint>,
    ) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        Self {
            chain_id: chain_id.into(),
            display_name: display_name.into(),
            native_symbol: native_symbol.into(),
            decimals,
            endpoints,
            rps_hint: None,
        }
    }

    pub fn http_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.transport == TransportKind::Http)
    }

    pub fn ws_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| e.transport == TransportKind::WebSocket)
    }
}

/// Lets the RPC fallback chain classify an upstream error without knowing
/// its concrete shape — mirrors how `web3_proxy` downcasts
/// `HttpClientError`/`WsClientError` to read the JSON-RPC status.
pub trait RpcErrorClassify {
    fn status_code(&self) -> Option<u16> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct EndpointAttemptError {
    pub endpoint: Arc<str>,
    pub provider: Arc<str>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AllEndpointsFailed {
    pub chain: Arc<str>,
    pub errors: Vec<EndpointAttemptError>,
}

impl std::fmt::Display for AllEndpointsFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all endpoints failed for chain {}: ", self.chain)?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}/{}: {}", e.provider, e.endpoint, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for AllEndpointsFailed {}

#[derive(Debug, Clone)]
pub struct RpcOutcome<T> {
    pub value: T,
    pub endpoint: Arc<str>,
    pub provider: Arc<str>,
    pub latency: Duration,
    pub attempts: u32,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct RpcFallbackConfig {
    pub total_timeout: Duration,
    pub max_retry_attempts: u32,
    pub non_retriable_status: Vec<u16>,
    pub breaker: BreakerConfig,
    /// `maxWaitMs` for the per-endpoint token bucket created on first use.
    pub bucket_max_wait: Duration,
}

impl Default for RpcFallbackConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(30),
            max_retry_attempts: 2,
            non_retriable_status: vec![401, 403],
            breaker: BreakerConfig::default(),
            bucket_max_wait: Duration::from_secs(5),
        }
    }
}

/// Single-writer-per-chain mapping from cache key to the last successfully
/// returned value for that key. Values are stored as `serde_json::Value` so
/// one cache can serve every operation shape a chain adapter needs.
#[derive(Default)]
pub struct FallbackCache {
    entries: Mutex<HashMap<Arc<str>, serde_json::Value>>,
}

impl FallbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(encoded) = serde_json::to_value(value) {
            self.entries.lock().insert(Arc::from(key), encoded);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Debug, Clone)]
pub struct EndpointStat {
    pub endpoint: Arc<str>,
    pub provider: Arc<str>,
    pub breaker_state: BreakerStateKind,
    pub metrics: Option<MetricsSnapshot>,
}

enum AttemptFailure<E> {
    RateLimit(token_bucket::RateLimitError),
    BreakerOpen,
    Upstream(E),
    DeadlineExceeded,
}

/// Orchestrates endpoints + breaker + limiter + deadline + cache for one
/// chain.
pub struct RpcFallbackChain {
    chain: ChainConfig,
    config: RpcFallbackConfig,
    breakers: Arc<BreakerRegistry>,
    limiters: Arc<TokenBucketRegistry>,
    metrics: Arc<MetricsStore>,
    cache: Option<Arc<FallbackCache>>,
}

impl RpcFallbackChain {
    pub fn new(
        chain: ChainConfig,
        config: RpcFallbackConfig,
        breakers: Arc<BreakerRegistry>,
        limiters: Arc<TokenBucketRegistry>,
        metrics: Arc<MetricsStore>,
        enable_cache: bool,
    ) -> Self {
        Self {
            chain,
            config,
            breakers,
            limiters,
            metrics,
            cache: enable_cache.then(|| Arc::new(FallbackCache::new())),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain.chain_id
    }

    fn breaker_for(&self, endpoint: &Endpoint) -> Arc<Breaker> {
        self.breakers.get_or_create(&self.chain.chain_id, &endpoint.provider)
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStat> {
        self.chain
            .http_endpoints()
            .map(|e| EndpointStat {
                endpoint: e.url.clone(),
                provider: e.provider.clone(),
                breaker_state: self.breaker_for(e).state(),
                metrics: self.metrics.snapshot(&self.chain.chain_id, &e.provider),
            })
            .collect()
    }

    /// Run `op(endpoint_url)` across every HTTP endpoint in priority order.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<RpcOutcome<T>, AllEndpointsFailed>
    where
        F: Fn(&str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + RpcErrorClassify,
    {
        let deadline = Instant::now() + self.config.total_timeout;
        let mut errors = Vec::new();

        'endpoints: for endpoint in self.chain.http_endpoints() {
            if Instant::now() >= deadline {
                break;
            }

            let breaker = self.breaker_for(endpoint);
            if breaker.is_open() {
                trace!(chain = %self.chain.chain_id, provider = %endpoint.provider, "breaker open, skipping endpoint");
                continue;
            }

            let limiter = self
                .limiters
                .get_or_create(
                    &endpoint.url,
                    Some(TokenBucketConfig::from_rps(endpoint.max_rps, self.config.bucket_max_wait)),
                )
                .await;

            for attempt in 0..=self.config.max_retry_attempts {
                if Instant::now() >= deadline {
                    break 'endpoints;
                }

                let start = Instant::now();
                let remaining = deadline.saturating_duration_since(Instant::now());

                let attempt_fut = async {
                    limiter.acquire().await.map_err(AttemptFailure::RateLimit)?;
                    match breaker.execute(|| op(&endpoint.url)).await {
                        Err(BreakerError::Open) => Err(AttemptFailure::BreakerOpen),
                        Err(BreakerError::Upstream(e)) => Err(AttemptFailure::Upstream(e)),
                        Ok(value) => Ok(value),
                    }
                };

                let attempt_result: Result<T, AttemptFailure<E>> = match tokio::time::timeout(remaining, attempt_fut).await {
                    Err(_elapsed) => Err(AttemptFailure::DeadlineExceeded),
                    Ok(inner) => inner,
                };

                match attempt_result {
                    Ok(value) => {
                        let latency = start.elapsed();
                        self.metrics.record_success(&self.chain.chain_id, &endpoint.provider, latency);
                        trace!(chain = %self.chain.chain_id, provider = %endpoint.provider, attempt, "rpc attempt succeeded");
                        return Ok(RpcOutcome {
                            value,
                            endpoint: endpoint.url.clone(),
                            provider: endpoint.provider.clone(),
                            latency,
                            attempts: attempt + 1,
                            from_cache: false,
                        });
                    }
                    Err(AttemptFailure::BreakerOpen) => {
                        debug!(chain = %self.chain.chain_id, provider = %endpoint.provider, "breaker denied probe mid-retry");
                        break;
                    }
                    Err(AttemptFailure::DeadlineExceeded) => {
                        warn!(chain = %self.chain.chain_id, provider = %endpoint.provider, "total deadline exceeded");
                        errors.push(EndpointAttemptError {
                            endpoint: endpoint.url.clone(),
                            provider: endpoint.provider.clone(),
                            message: "total deadline exceeded".to_string(),
                        });
                        break 'endpoints;
                    }
                    Err(AttemptFailure::RateLimit(e)) => {
                        self.metrics.record_error(&self.chain.chain_id, &endpoint.provider, start.elapsed());
                        errors.push(EndpointAttemptError {
                            endpoint: endpoint.url.clone(),
                            provider: endpoint.provider.clone(),
                            message: e.to_string(),
                        });
                        if attempt < self.config.max_retry_attempts {
                            self.sleep_backoff(attempt, deadline).await;
                        }
                    }
                    Err(AttemptFailure::Upstream(e)) => {
                        self.metrics.record_error(&self.chain.chain_id, &endpoint.provider, start.elapsed());
                        let status = e.status_code();
                        error!(chain = %self.chain.chain_id, provider = %endpoint.provider, %e, "rpc attempt failed");
                        errors.push(EndpointAttemptError {
                            endpoint: endpoint.url.clone(),
                            provider: endpoint.provider.clone(),
                            message: e.to_string(),
                        });

                        if let Some(code) = status {
                            if self.config.non_retriable_status.contains(&code) {
                                break;
                            }
                        }

                        if attempt < self.config.max_retry_attempts {
                            self.sleep_backoff(attempt, deadline).await;
                        }
                    }
                }
            }
        }

        Err(AllEndpointsFailed {
            chain: self.chain.chain_id.clone(),
            errors,
        })
    }

    async fn sleep_backoff(&self, attempt: u32, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let backoff = Duration::from_millis(1000u64 << attempt).min(remaining);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }

    /// `execute`, falling back to the last cached value for `key` on
    /// terminal failure. Re-raises if caching is disabled or the key has
    /// never been populated.
    pub async fn execute_with_cache<T, E, F, Fut>(&self, key: &str, op: F) -> Result<RpcOutcome<T>, AllEndpointsFailed>
    where
        F: Fn(&str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + RpcErrorClassify,
        T: Serialize + DeserializeOwned + Clone,
    {
        match self.execute(op).await {
            Ok(outcome) => {
                if let Some(cache) = &self.cache {
                    cache.put(key, &outcome.value);
                }
                Ok(outcome)
            }
            Err(err) => {
                if let Some(cache) = &self.cache {
                    if let Some(value) = cache.get::<T>(key) {
                        debug!(chain = %self.chain.chain_id, key, "serving from last-known-good cache");
                        return Ok(RpcOutcome {
                            value,
                            endpoint: Arc::from("cache"),
                            provider: Arc::from("cache"),
                            latency: Duration::ZERO,
                            attempts: 0,
                            from_cache: true,
                        });
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct TestError {
        status: Option<u16>,
        message: &'static str,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl RpcErrorClassify for TestError {
        fn status_code(&self) -> Option<u16> {
            self.status
        }
    }

    fn endpoint(url: &str, provider: &str, priority: u32) -> Endpoint {
        Endpoint {
            url: Arc::from(url),
            provider: Arc::from(provider),
            priority,
            max_rps: 1000.0,
            transport: TransportKind::Http,
        }
    }

    fn chain(endpoints: Vec<Endpoint>) -> ChainConfig {
        ChainConfig::new("1", "ethereum", "ETH", 18, endpoints)
    }

    fn harness(chain_cfg: ChainConfig, config: RpcFallbackConfig, enable_cache: bool) -> RpcFallbackChain {
        RpcFallbackChain::new(
            chain_cfg,
            config,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(TokenBucketRegistry::new(TokenBucketConfig::from_rps(1000.0, Duration::from_secs(5)))),
            Arc::new(MetricsStore::default()),
            enable_cache,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_primary_succeeds() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1), endpoint("https://secondary", "secondary", 2)]);
        let fc = harness(cfg, RpcFallbackConfig::default(), false);

        let outcome = fc
            .execute(|url| async move {
                if url == "https://primary" {
                    Ok::<_, TestError>("ok")
                } else {
                    panic!("secondary should not be called")
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "ok");
        assert_eq!(&*outcome.provider, "primary");
        assert_eq!(outcome.attempts, 1);

        let stats = fc.endpoint_stats();
        let primary_stats = stats.iter().find(|s| &*s.provider == "primary").unwrap();
        assert_eq!(primary_stats.metrics.unwrap().total_requests, 1);
        assert_eq!(primary_stats.breaker_state, BreakerStateKind::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_failure_routes_to_secondary() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1), endpoint("https://secondary", "secondary", 2)]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.max_retry_attempts = 0;
        let fc = harness(cfg, rcfg, false);

        let outcome = fc
            .execute(|url| async move {
                if url == "https://primary" {
                    Err(TestError { status: None, message: "boom" })
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "ok");
        assert_eq!(&*outcome.provider, "secondary");
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_and_routes_around_primary() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1), endpoint("https://secondary", "secondary", 2)]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.max_retry_attempts = 0;
        rcfg.breaker.failure_threshold = 2;
        rcfg.breaker.volume_threshold = 2;
        let fc = harness(cfg, rcfg, false);

        for _ in 0..2 {
            let outcome = fc
                .execute(|url| async move {
                    if url == "https://primary" {
                        Err(TestError { status: None, message: "boom" })
                    } else {
                        Ok("ok")
                    }
                })
                .await
                .unwrap();
            assert_eq!(&*outcome.provider, "secondary");
        }

        let primary_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&primary_calls);
        let outcome = fc
            .execute(move |url| {
                let calls = Arc::clone(&calls);
                async move {
                    if url == "https://primary" {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(TestError { status: None, message: "boom" })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(&*outcome.provider, "secondary");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);

        let stats = fc.endpoint_stats();
        let primary_stats = stats.iter().find(|s| &*s.provider == "primary").unwrap();
        assert_eq!(primary_stats.breaker_state, BreakerStateKind::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn all_fail_serves_last_known_good_from_cache() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1)]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.max_retry_attempts = 0;
        let fc = harness(cfg, rcfg, true);

        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&should_fail);

        let outcome = fc
            .execute_with_cache("balance:0xabc", move |_url| {
                let flag = Arc::clone(&flag);
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Err(TestError { status: None, message: "down" })
                    } else {
                        Ok(100u64)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, 100);

        should_fail.store(true, Ordering::SeqCst);
        let flag = Arc::clone(&should_fail);
        let outcome = fc
            .execute_with_cache("balance:0xabc", move |_url| {
                let flag = Arc::clone(&flag);
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Err(TestError { status: None, message: "down" })
                    } else {
                        Ok(100u64)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 100);
        assert!(outcome.from_cache);
        assert_eq!(&*outcome.endpoint, "cache");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_status_tries_primary_exactly_once() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1), endpoint("https://secondary", "secondary", 2)]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.max_retry_attempts = 2;
        let fc = harness(cfg, rcfg, false);

        let primary_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&primary_calls);

        let outcome = fc
            .execute(move |url| {
                let calls = Arc::clone(&calls);
                async move {
                    if url == "https://primary" {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(TestError { status: Some(403), message: "forbidden" })
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(&*outcome.provider, "secondary");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_endpoints_failed_without_cache_surfaces_errors() {
        let cfg = chain(vec![endpoint("https://primary", "primary", 1)]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.max_retry_attempts = 0;
        let fc = harness(cfg, rcfg, false);

        let err = fc
            .execute(|_url| async { Err::<(), _>(TestError { status: None, message: "down" }) })
            .await
            .unwrap_err();

        assert_eq!(err.errors.len(), 1);
        assert_eq!(&*err.chain, "1");
    }

    /// A starved limiter (zero capacity, zero refill) would otherwise make
    /// `limiter.acquire()` wait its full `bucket_max_wait` (5s here) before
    /// failing. With the limiter wrapped in the same per-attempt
    /// `tokio::time::timeout` as the breaker-guarded call, the attempt must
    /// instead fail at the chain's much shorter overall deadline.
    #[tokio::test(start_paused = true)]
    async fn starved_limiter_does_not_outlast_the_overall_deadline() {
        let starved_endpoint = Endpoint {
            url: Arc::from("https://primary"),
            provider: Arc::from("primary"),
            priority: 1,
            max_rps: 0.0,
            transport: TransportKind::Http,
        };
        let cfg = chain(vec![starved_endpoint]);
        let mut rcfg = RpcFallbackConfig::default();
        rcfg.total_timeout = Duration::from_millis(200);
        rcfg.max_retry_attempts = 0;
        rcfg.bucket_max_wait = Duration::from_secs(5);
        let fc = harness(cfg, rcfg, false);

        let start = Instant::now();
        let err = fc
            .execute(|_url| async { Ok::<_, TestError>("unreachable") })
            .await
            .unwrap_err();

        assert_eq!(err.errors.len(), 1);
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "attempt should fail at the ~200ms overall deadline, not the 5s limiter max_wait"
        );
    }
}
