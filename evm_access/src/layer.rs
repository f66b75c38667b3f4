//! Top-level wiring: assembles a [`RoutingConfig`] and a set of chain /
//! protocol adapters into the façades, mirroring the role `Web3ProxyApp`
//! plays tying `Web3Connections`, the response cache and the rate limiter
//! together behind one handle that the rest of the application holds.

use std::collections::HashMap;
use std::sync::Arc;

use bulkhead::Bulkhead;
use health_monitor::{HealthCheckFn, HealthMonitor};
use provider_metrics::MetricsStore;
use ws_pool::{EventBus, WsPool};

use crate::config::RoutingConfig;
use crate::facades::{BalanceFacade, DefiFacade, TransactionFacade};
use crate::ports::{ChainAdapter, ChainId, DefiProtocolAdapter};

/// Owns the shared façades and background services (health monitor, websocket
/// pool) for one process. Cloning is cheap: everything inside is an `Arc`.
pub struct AccessLayer {
    pub config: RoutingConfig,
    pub balances: BalanceFacade,
    pub transactions: TransactionFacade,
    pub defi: DefiFacade,
    pub health: Arc<HealthMonitor>,
    pub ws_pool: Arc<WsPool>,
    pub metrics: Arc<MetricsStore>,
}

impl AccessLayer {
    /// `adapters` and `protocols` are supplied by the embedding application;
    /// this workspace never constructs a `ChainAdapter` itself (spec.md §1).
    ///
    /// Fails fast if `config` is invalid rather than letting a zeroed
    /// duration surface later as a confusing hang or instant breaker trip.
    pub fn new(
        config: RoutingConfig,
        adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
        protocols: Vec<Arc<dyn DefiProtocolAdapter>>,
        health_check: HealthCheckFn,
        connector: Arc<dyn ws_pool::TransportConnector>,
        events: Arc<dyn EventBus>,
    ) -> Result<Arc<Self>, String> {
        config.validate()?;

        let metrics = Arc::new(MetricsStore::new(config.metrics_window()));
        let health = HealthMonitor::new(config.to_health_monitor_config(), health_check, Arc::clone(&metrics));
        let ws_pool = Arc::new(WsPool::new(connector, events, config.to_ws_pool_config()));

        let bulkhead_config = config.to_bulkhead_config();
        let mut bulkheads: HashMap<ChainId, Arc<Bulkhead>> = HashMap::new();

        for adapter in adapters.values() {
            let chain = adapter.chain_info();
            for endpoint in chain.http_endpoints().chain(chain.ws_endpoints()) {
                health.register(chain.chain_id.clone(), endpoint.provider.clone(), endpoint.url.clone());
            }
            bulkheads
                .entry(chain.chain_id.clone())
                .or_insert_with(|| Arc::new(Bulkhead::new(bulkhead_config)));
        }

        Ok(Arc::new(Self {
            config,
            balances: BalanceFacade::new(adapters.clone(), bulkheads.clone()),
            transactions: TransactionFacade::new(adapters, bulkheads),
            defi: DefiFacade::new(protocols),
            health,
            ws_pool,
            metrics,
        }))
    }

    /// Starts the health monitor's background polling loop. Call once per
    /// process; idempotent restarts are `HealthMonitor`'s responsibility.
    pub async fn start(&self) {
        self.health.start().await;
    }

    /// Tears down every background service: stops the health monitor's
    /// polling loop and aborts every pooled websocket connection's
    /// heartbeat/reconnect task. Call once at process shutdown; the layer
    /// is not usable afterwards.
    pub async fn destroy(&self) {
        self.health.stop();
        self.ws_pool.destroy().await;
    }
}
