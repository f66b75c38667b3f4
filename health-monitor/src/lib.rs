//! Periodic per-endpoint liveness probing.
//!
//! Deliberately never touches breaker state — grounded on
//! `provider_health.rs`'s separation between health bookkeeping
//! (`ProviderHealthTracker`) and the routing decision that consumes it;
//! here the separation is enforced by construction, since `health-monitor`
//! has no dependency on `circuit-breaker` at all.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use provider_metrics::MetricsStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub type HealthCheckFuture = Pin<Box<dyn Future<Output = Result<u64, String>> + Send>>;
pub type HealthCheckFn = Arc<dyn Fn(Arc<str>) -> HealthCheckFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub status: HealthStatus,
    pub last_block: Option<u64>,
    pub last_error: Option<String>,
    pub last_checked: Option<Instant>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_block: None,
            last_error: None,
            last_checked: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Registered targets plus the latest known health per endpoint, keyed by
/// (chain, provider, endpoint) for metrics attribution.
struct Target {
    chain: Arc<str>,
    provider: Arc<str>,
    endpoint: Arc<str>,
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    check_fn: HealthCheckFn,
    metrics: Arc<MetricsStore>,
    targets: Mutex<Vec<Target>>,
    state: Mutex<HashMap<Arc<str>, EndpointHealth>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, check_fn: HealthCheckFn, metrics: Arc<MetricsStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            check_fn,
            metrics,
            targets: Mutex::new(Vec::new()),
            state: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    pub fn register(&self, chain: impl Into<Arc<str>>, provider: impl Into<Arc<str>>, endpoint: impl Into<Arc<str>>) {
        let endpoint: Arc<str> = endpoint.into();
        self.targets.lock().push(Target {
            chain: chain.into(),
            provider: provider.into(),
            endpoint: endpoint.clone(),
        });
        self.state.lock().entry(endpoint).or_default();
    }

    pub fn health_of(&self, endpoint: &str) -> Option<EndpointHealth> {
        self.state.lock().get(endpoint).cloned()
    }

    pub fn all_health(&self) -> HashMap<Arc<str>, EndpointHealth> {
        self.state.lock().clone()
    }

    /// Run an initial check, then schedule periodic checks every
    /// `check_interval` until [`Self::stop`] is called.
    pub async fn start(self: &Arc<Self>) {
        self.run_all_checks().await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.check_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                this.run_all_checks().await;
            }
        });

        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Ping every registered endpoint concurrently.
    pub async fn run_all_checks(self: &Arc<Self>) {
        let targets: Vec<Arc<str>> = {
            let targets = self.targets.lock();
            targets.iter().map(|t| t.endpoint.clone()).collect()
        };

        let checks = targets.into_iter().map(|endpoint| {
            let this = Arc::clone(self);
            async move { this.check_one(endpoint).await }
        });

        futures::future::join_all(checks).await;
    }

    async fn check_one(&self, endpoint: Arc<str>) {
        let (chain, provider) = {
            let targets = self.targets.lock();
            match targets.iter().find(|t| t.endpoint == endpoint) {
                Some(t) => (t.chain.clone(), t.provider.clone()),
                None => return,
            }
        };

        let start = Instant::now();
        let result = (self.check_fn)(endpoint.clone()).await;
        let latency = start.elapsed();

        let mut state = self.state.lock();
        let entry = state.entry(endpoint.clone()).or_default();
        entry.last_checked = Some(Instant::now());

        match result {
            Ok(block) => {
                entry.status = HealthStatus::Healthy;
                entry.last_block = Some(block);
                entry.last_error = None;
                self.metrics.record_success(&chain, &provider, latency);
                trace!(%endpoint, block, "health check ok");
            }
            Err(message) => {
                entry.status = HealthStatus::Unhealthy;
                entry.last_error = Some(message.clone());
                self.metrics.record_error(&chain, &provider, latency);
                warn!(%endpoint, error = %message, "health check failed");
            }
        }
        debug!(%endpoint, status = ?entry.status, "health check recorded");
    }
}
