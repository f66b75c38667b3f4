//! External-collaborator traits. Everything here is implemented by the
//! embedding application, not by this workspace — on-chain call shapes,
//! DeFi-protocol decoding, the JSON-RPC wire client, and the browser UI are
//! all out of scope (spec.md §1's "out of scope" list), reached only
//! through these narrow interfaces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rpc_fallback::ChainConfig;
use thiserror::Error;
use tokio::time::Instant;

pub use rpc_fallback::RpcErrorClassify;
pub use ws_pool::{EventBus, PoolEventType};

pub type ChainId = Arc<str>;
pub type Address = Arc<str>;

#[derive(Debug, Clone)]
pub struct TokenDescriptor {
    pub contract: Address,
    pub decimals: u8,
    pub symbol: Arc<str>,
}

#[derive(Debug, Clone)]
pub struct NativeBalance {
    pub chain_id: ChainId,
    pub address: Address,
    pub balance_wei: u128,
}

#[derive(Debug, Clone)]
pub struct TokenBalance {
    pub token: TokenDescriptor,
    pub balance: u128,
}

#[derive(Debug, Clone, Default)]
pub struct TxQueryOptions {
    pub limit: Option<u32>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TxSummary {
    pub hash: Arc<str>,
    pub block_number: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value_wei: u128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LendingPosition {
    pub protocol: Arc<str>,
    pub asset: Arc<str>,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StakedPosition {
    pub protocol: Arc<str>,
    pub asset: Arc<str>,
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidityPosition {
    pub protocol: Arc<str>,
    pub pool: Arc<str>,
    pub share: f64,
}

pub struct Unsubscribe(pub Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn call(self) {
        (self.0)()
    }
}

pub type BalanceSink = Arc<dyn Fn(NativeBalance) + Send + Sync>;
pub type TxSink = Arc<dyn Fn(TxSummary) + Send + Sync>;

#[derive(Debug, Error, Clone)]
pub enum PortError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

#[derive(Debug, Error, Clone)]
pub enum RpcCallError {
    #[error("rpc call failed (status {status:?}): {message}")]
    Failed { status: Option<u16>, message: String },
}

impl RpcErrorClassify for RpcCallError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Failed { status, .. } => *status,
        }
    }
}

/// `(endpointUrl) -> value`. Implementations must honour the endpoint URL
/// with no internal routing, and surface HTTP status codes so the RPC
/// fallback chain can classify 401/403 as non-retriable.
pub trait RpcCall: Send + Sync {
    fn call(&self, endpoint: &str, method: &str, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value, RpcCallError>>;
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    async fn native_balance(&self, address: &Address) -> Result<NativeBalance, PortError>;
    async fn token_balances(&self, address: &Address, tokens: &[TokenDescriptor]) -> Result<Vec<TokenBalance>, PortError>;
    async fn transactions(&self, address: &Address, opts: TxQueryOptions) -> Result<Vec<TxSummary>, PortError>;
    async fn subscribe_balance(&self, address: &Address, sink: BalanceSink) -> Result<Unsubscribe, PortError>;
    async fn subscribe_transactions(&self, address: &Address, sink: TxSink) -> Result<Unsubscribe, PortError>;
    fn chain_info(&self) -> &ChainConfig;
    async fn is_healthy(&self) -> bool;
    async fn connect(&self) -> Result<(), PortError>;
    async fn disconnect(&self) -> Result<(), PortError>;
}

#[async_trait]
pub trait DefiProtocolAdapter: Send + Sync {
    fn protocol_name(&self) -> &str;
    fn supported_chains(&self) -> &[ChainId];
    fn supports_chain(&self, chain_id: ChainId) -> bool;
    async fn lending_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<LendingPosition>, PortError>;
    async fn staked_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<StakedPosition>, PortError>;
    async fn liquidity_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<LiquidityPosition>, PortError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, dur: Duration) -> BoxFuture<'static, ()>;
}
