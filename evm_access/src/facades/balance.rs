use std::collections::HashMap;
use std::sync::Arc;

use account_fanin::{fan_in, AddressRequest, FanInOutcome};
use bulkhead::Bulkhead;
use fallback_chain::{FallbackChain, Strategy};
use parking_lot::Mutex;
use tracing::Instrument;

use crate::errors::AccessError;
use crate::ports::{ChainAdapter, ChainId, NativeBalance};

type CacheKey = (ChainId, Arc<str>);

/// Dedupes a batch of account-attributed balance requests down to one
/// adapter call per unique (address, chain), then fans the result back
/// out to every account that asked for it. Falls back to the last
/// observed balance for that (chain, address) pair when the live call
/// fails, so a transient adapter outage degrades to a stale-but-present
/// answer rather than an error. Each unique query also runs through the
/// chain's bulkhead, so a burst of distinct addresses on one chain can't
/// run unbounded concurrent adapter calls.
pub struct BalanceFacade {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
    bulkheads: HashMap<ChainId, Arc<Bulkhead>>,
    last_known: Mutex<HashMap<CacheKey, NativeBalance>>,
}

impl BalanceFacade {
    pub fn new(adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>, bulkheads: HashMap<ChainId, Arc<Bulkhead>>) -> Self {
        Self { adapters, bulkheads, last_known: Mutex::new(HashMap::new()) }
    }

    pub async fn native_balances(&self, requests: &[AddressRequest]) -> FanInOutcome<NativeBalance, AccessError> {
        fan_in(requests, |address, chain_id| {
            let span = tracing::info_span!("balance_facade.native_balance", chain_id = %chain_id, address = %address);
            async move {
                let adapter = match self.adapters.get(&chain_id) {
                    Some(adapter) => adapter.clone(),
                    None => {
                        let err = AccessError::Validation(format!("chain {chain_id} not configured"));
                        err.log();
                        return Err(err);
                    }
                };
                let bulkhead = self.bulkheads.get(&chain_id).cloned();
                let key: CacheKey = (chain_id.clone(), Arc::from(address.to_lowercase()));

                let live_address = address.clone();
                let cached = self.last_known.lock().get(&key).cloned();

                let mut strategies = vec![Strategy::new("live", move || {
                    let adapter = adapter.clone();
                    let address = live_address.clone();
                    let bulkhead = bulkhead.clone();
                    async move {
                        match bulkhead {
                            Some(bulkhead) => bulkhead
                                .execute(|| async { adapter.native_balance(&address).await })
                                .await
                                .map_err(|e| e.to_string())?
                                .map_err(|e| e.to_string()),
                            None => adapter.native_balance(&address).await.map_err(|e| e.to_string()),
                        }
                    }
                })];
                if let Some(cached) = cached.clone() {
                    strategies.push(Strategy::new("last-known", move || {
                        let cached = cached.clone();
                        async move { Ok(cached) }
                    }));
                }

                let outcome = match FallbackChain::new(strategies).execute().await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let err = AccessError::Upstream(anyhow::anyhow!(e.to_string()));
                        err.log();
                        return Err(err);
                    }
                };

                if outcome.name.as_deref() == Some("live") {
                    self.last_known.lock().insert(key, outcome.value.clone());
                }

                Ok(outcome.value)
            }
            .instrument(span)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::*;
    use async_trait::async_trait;
    use rpc_fallback::ChainConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        chain_info: ChainConfig,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChainAdapter for FakeAdapter {
        async fn native_balance(&self, address: &Address) -> Result<NativeBalance, PortError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NativeBalance {
                chain_id: self.chain_info.chain_id.clone(),
                address: address.clone(),
                balance_wei: 42,
            })
        }
        async fn token_balances(&self, _address: &Address, _tokens: &[TokenDescriptor]) -> Result<Vec<TokenBalance>, PortError> {
            Ok(Vec::new())
        }
        async fn transactions(&self, _address: &Address, _opts: TxQueryOptions) -> Result<Vec<TxSummary>, PortError> {
            Ok(Vec::new())
        }
        async fn subscribe_balance(&self, _address: &Address, _sink: BalanceSink) -> Result<Unsubscribe, PortError> {
            Ok(Unsubscribe(Box::new(|| {})))
        }
        async fn subscribe_transactions(&self, _address: &Address, _sink: TxSink) -> Result<Unsubscribe, PortError> {
            Ok(Unsubscribe(Box::new(|| {})))
        }
        fn chain_info(&self) -> &ChainConfig {
            &self.chain_info
        }
        async fn is_healthy(&self) -> bool {
            true
        }
        async fn connect(&self) -> Result<(), PortError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), PortError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn distinct_accounts_same_address_dedupe_to_one_adapter_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = ChainConfig::new("1", "ethereum", "ETH", 18, vec![]);
        let adapter: Arc<dyn ChainAdapter> = Arc::new(FakeAdapter { chain_info: chain, calls: Arc::clone(&calls) });

        let mut adapters = HashMap::new();
        adapters.insert(Arc::from("1"), adapter);
        let facade = BalanceFacade::new(adapters, HashMap::new());

        let requests = vec![
            AddressRequest {
                account_id: Arc::from("acct-a"),
                address: Arc::from("0xabc"),
                chain_scope: vec![Arc::from("1")],
            },
            AddressRequest {
                account_id: Arc::from("acct-b"),
                address: Arc::from("0xABC"),
                chain_scope: vec![Arc::from("1")],
            },
        ];

        let outcome = facade.native_balances(&requests).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn bulkhead_full_surfaces_as_bulkhead_full_error() {
        let chain = ChainConfig::new("1", "ethereum", "ETH", 18, vec![]);
        let adapter: Arc<dyn ChainAdapter> = Arc::new(FakeAdapter { chain_info: chain, calls: Arc::new(AtomicUsize::new(0)) });

        let mut adapters = HashMap::new();
        adapters.insert(Arc::from("1"), adapter);

        let mut bulkheads: HashMap<ChainId, Arc<Bulkhead>> = HashMap::new();
        bulkheads.insert(
            Arc::from("1"),
            Arc::new(Bulkhead::new(bulkhead::BulkheadConfig {
                max_concurrent: 0,
                max_queue: 0,
                queue_timeout: std::time::Duration::from_millis(10),
            })),
        );

        let facade = BalanceFacade::new(adapters, bulkheads);
        let requests = vec![AddressRequest {
            account_id: Arc::from("acct-a"),
            address: Arc::from("0xabc"),
            chain_scope: vec![Arc::from("1")],
        }];

        let outcome = facade.native_balances(&requests).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0].error, AccessError::Upstream(_)));
    }

    #[tokio::test]
    async fn unconfigured_chain_yields_validation_error_per_account() {
        let facade = BalanceFacade::new(HashMap::new(), HashMap::new());
        let requests = vec![AddressRequest {
            account_id: Arc::from("acct-a"),
            address: Arc::from("0xabc"),
            chain_scope: vec![Arc::from("999")],
        }];

        let outcome = facade.native_balances(&requests).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0].error, AccessError::Validation(_)));
    }
}
