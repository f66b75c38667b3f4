//! Per-chain WebSocket connection pool with HTTP-polling degradation.
//!
//! Generalizes `web3_proxy::rpcs::request`'s `RwLock<Option<Arc<Web3Provider>>>`
//! pattern and edgelord's per-connection supervisory task, over an injected
//! [`TransportConnector`] port rather than a concrete JSON-RPC client, since
//! this workspace carries no single RPC client dependency of its own.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rpc_fallback::{ChainConfig, Endpoint, TransportKind};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("no endpoints configured for transport {0:?}")]
    NoEndpoints(TransportKind),
    #[error("connect timed out for {endpoint}")]
    ConnectTimeout { endpoint: Arc<str> },
    #[error("connect failed for {endpoint}: {message}")]
    ConnectFailed { endpoint: Arc<str>, message: String },
    #[error("smoke call failed: {0}")]
    SmokeCallFailed(String),
    #[error("pool has no live connection for this chain")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventType {
    WebsocketConnected,
    WebsocketDisconnected,
    WebsocketReconnecting,
    WebsocketFailed,
    TransportFallbackToPolling,
}

impl PoolEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebsocketConnected => "WEBSOCKET_CONNECTED",
            Self::WebsocketDisconnected => "WEBSOCKET_DISCONNECTED",
            Self::WebsocketReconnecting => "WEBSOCKET_RECONNECTING",
            Self::WebsocketFailed => "WEBSOCKET_FAILED",
            Self::TransportFallbackToPolling => "TRANSPORT_FALLBACK_TO_POLLING",
        }
    }
}

/// Injected sink for pool lifecycle events.
pub trait EventBus: Send + Sync {
    fn emit(&self, event_type: PoolEventType, chain_id: &str, payload: serde_json::Value);
}

/// A live connection, reduced to the one operation the pool needs from it: a
/// cheap liveness probe. The real request surface lives behind whichever
/// chain adapter wraps this transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn smoke_call(&self) -> Result<(), TransportError>;
}

/// Opens transports for a given endpoint. Implemented externally (by
/// whatever JSON-RPC client the embedding application chooses) so this
/// crate stays client-library agnostic.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WsPoolConfig {
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for WsPoolConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

struct State {
    status: ConnectionStatus,
    transport_kind: Option<TransportKind>,
    transport: Option<Arc<dyn Transport>>,
    endpoint: Option<Arc<str>>,
}

/// One pooled connection for one chain.
pub struct ChainConnection {
    chain: ChainConfig,
    connector: Arc<dyn TransportConnector>,
    events: Arc<dyn EventBus>,
    config: WsPoolConfig,
    state: RwLock<State>,
    subscribers: AtomicI64,
    reconnect_attempt: AtomicU32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ChainConnection {
    fn new(chain: ChainConfig, connector: Arc<dyn TransportConnector>, events: Arc<dyn EventBus>, config: WsPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            chain,
            connector,
            events,
            config,
            state: RwLock::new(State {
                status: ConnectionStatus::Disconnected,
                transport_kind: None,
                transport: None,
                endpoint: None,
            }),
            subscribers: AtomicI64::new(0),
            reconnect_attempt: AtomicU32::new(0),
            supervisor: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.state.read().transport_kind
    }

    pub fn subscribe(&self) -> i64 {
        self.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn unsubscribe(&self) -> i64 {
        self.subscribers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn subscriber_count(&self) -> i64 {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Lazily connect: reuse a live transport, otherwise walk WS endpoints
    /// then fall back to HTTP polling.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<dyn Transport>, TransportError> {
        {
            let state = self.state.read();
            if state.status == ConnectionStatus::Connected {
                if let Some(transport) = &state.transport {
                    return Ok(Arc::clone(transport));
                }
            }
        }

        self.state.write().status = ConnectionStatus::Connecting;

        if let Some((endpoint, transport)) = self.walk(self.chain.ws_endpoints()).await {
            self.on_connected(endpoint, TransportKind::WebSocket, Arc::clone(&transport));
            self.spawn_heartbeat();
            return Ok(transport);
        }

        if let Some((endpoint, transport)) = self.walk(self.chain.http_endpoints()).await {
            let url = endpoint.url.clone();
            self.on_connected(endpoint, TransportKind::Http, Arc::clone(&transport));
            self.events.emit(
                PoolEventType::TransportFallbackToPolling,
                &self.chain.chain_id,
                serde_json::json!({ "endpoint": &*url }),
            );
            self.spawn_heartbeat();
            return Ok(transport);
        }

        self.state.write().status = ConnectionStatus::Failed;
        Err(TransportError::NoEndpoints(TransportKind::WebSocket))
    }

    async fn walk<'a>(&self, endpoints: impl Iterator<Item = &'a Endpoint>) -> Option<(Endpoint, Arc<dyn Transport>)> {
        for endpoint in endpoints {
            match tokio::time::timeout(self.config.connection_timeout, self.connector.connect(endpoint)).await {
                Ok(Ok(transport)) => {
                    if transport.smoke_call().await.is_ok() {
                        return Some((endpoint.clone(), transport));
                    }
                    trace!(chain = %self.chain.chain_id, endpoint = %endpoint.url, "smoke call failed on connect");
                }
                Ok(Err(e)) => {
                    trace!(chain = %self.chain.chain_id, endpoint = %endpoint.url, error = %e, "connect failed");
                }
                Err(_elapsed) => {
                    trace!(chain = %self.chain.chain_id, endpoint = %endpoint.url, "connect timed out");
                }
            }
        }
        None
    }

    fn on_connected(&self, endpoint: Endpoint, kind: TransportKind, transport: Arc<dyn Transport>) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Connected;
        state.transport_kind = Some(kind);
        state.transport = Some(transport);
        state.endpoint = Some(endpoint.url.clone());
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        drop(state);

        if kind == TransportKind::WebSocket {
            debug!(chain = %self.chain.chain_id, endpoint = %endpoint.url, "websocket connected");
            self.events.emit(PoolEventType::WebsocketConnected, &self.chain.chain_id, serde_json::json!({ "endpoint": &*endpoint.url }));
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move {
            this.heartbeat_loop().await;
        }));
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;

            let transport = { self.state.read().transport.clone() };
            let Some(transport) = transport else {
                break;
            };

            let probe = tokio::time::timeout(self.config.pong_timeout, transport.smoke_call()).await;
            match probe {
                Ok(Ok(())) => continue,
                _ => {
                    warn!(chain = %self.chain.chain_id, "heartbeat failed, treating as disconnect");
                    self.on_disconnected();
                    self.reconnect().await;
                    break;
                }
            }
        }
    }

    fn on_disconnected(&self) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Disconnected;
        state.transport = None;
        drop(state);
        self.events.emit(PoolEventType::WebsocketDisconnected, &self.chain.chain_id, serde_json::json!({}));
    }

    async fn reconnect(self: &Arc<Self>) {
        self.state.write().status = ConnectionStatus::Reconnecting;
        *self.supervisor.lock() = None;

        for attempt in 1..=self.config.max_reconnect_attempts {
            self.reconnect_attempt.store(attempt, Ordering::SeqCst);
            let delay = self.backoff_delay(attempt);
            self.events.emit(
                PoolEventType::WebsocketReconnecting,
                &self.chain.chain_id,
                serde_json::json!({ "attempt": attempt, "delay_ms": delay.as_millis() as u64 }),
            );
            tokio::time::sleep(delay).await;

            if let Some((endpoint, transport)) = self.walk(self.chain.ws_endpoints()).await {
                self.on_connected(endpoint, TransportKind::WebSocket, transport);
                self.spawn_heartbeat();
                return;
            }
        }

        self.state.write().status = ConnectionStatus::Failed;
        self.events.emit(PoolEventType::WebsocketFailed, &self.chain.chain_id, serde_json::json!({ "attempts": self.config.max_reconnect_attempts }));
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(0.0..=(base / 2.0));
        let computed = base * 2f64.powi(attempt as i32 - 1) + jitter;
        Duration::from_secs_f64(computed).min(self.config.reconnect_max_delay)
    }

    /// Aborts the heartbeat/reconnect supervisor task, drops the live
    /// transport and resets subscriber accounting. Idempotent.
    fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        let mut state = self.state.write();
        state.status = ConnectionStatus::Disconnected;
        state.transport = None;
        state.transport_kind = None;
        state.endpoint = None;
        drop(state);
        self.subscribers.store(0, Ordering::SeqCst);
        self.events.emit(PoolEventType::WebsocketDisconnected, &self.chain.chain_id, serde_json::json!({}));
    }
}

/// Owns one [`ChainConnection`] per chain, created lazily on first
/// `connect`.
pub struct WsPool {
    connector: Arc<dyn TransportConnector>,
    events: Arc<dyn EventBus>,
    config: WsPoolConfig,
    connections: Cache<Arc<str>, Arc<ChainConnection>>,
}

impl WsPool {
    pub fn new(connector: Arc<dyn TransportConnector>, events: Arc<dyn EventBus>, config: WsPoolConfig) -> Self {
        Self {
            connector,
            events,
            config,
            connections: Cache::builder().build(),
        }
    }

    pub async fn get_or_connect(&self, chain: &ChainConfig) -> Arc<ChainConnection> {
        let key: Arc<str> = chain.chain_id.clone();
        let connector = Arc::clone(&self.connector);
        let events = Arc::clone(&self.events);
        let config = self.config;
        let chain = chain.clone();
        self.connections
            .get_with(key, async move { ChainConnection::new(chain, connector, events, config) })
            .await
    }

    /// Tears down one chain's pooled connection: aborts its supervisor task
    /// and drops the cache entry. A later `get_or_connect` for the same
    /// chain lazily reconnects from scratch.
    pub async fn disconnect(&self, chain_id: &str) {
        if let Some(conn) = self.connections.get(chain_id).await {
            conn.disconnect();
        }
        self.connections.invalidate(chain_id).await;
    }

    /// Tears down every pooled connection: aborts all supervisor tasks and
    /// clears the cache. Call once at process shutdown.
    pub async fn destroy(&self) {
        for (_, conn) in self.connections.iter() {
            conn.disconnect();
        }
        self.connections.invalidate_all();
    }
}
