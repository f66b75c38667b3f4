use std::collections::HashMap;
use std::sync::Arc;

use account_fanin::{fan_in, AddressRequest, FanInOutcome};
use bulkhead::Bulkhead;
use tracing::Instrument;

use crate::errors::AccessError;
use crate::ports::{ChainAdapter, ChainId, TxQueryOptions, TxSummary};

/// Same dedupe-and-fan-out shape as `BalanceFacade`, applied to transaction
/// history. `opts` is shared across the whole batch: callers that need
/// per-account filters should split the batch themselves. Each unique
/// query is bounded by the chain's bulkhead, the same as balance lookups.
pub struct TransactionFacade {
    adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>,
    bulkheads: HashMap<ChainId, Arc<Bulkhead>>,
}

impl TransactionFacade {
    pub fn new(adapters: HashMap<ChainId, Arc<dyn ChainAdapter>>, bulkheads: HashMap<ChainId, Arc<Bulkhead>>) -> Self {
        Self { adapters, bulkheads }
    }

    pub async fn transactions(
        &self,
        requests: &[AddressRequest],
        opts: TxQueryOptions,
    ) -> FanInOutcome<Vec<TxSummary>, AccessError> {
        fan_in(requests, |address, chain_id| {
            let opts = opts.clone();
            let span = tracing::info_span!("transaction_facade.transactions", chain_id = %chain_id, address = %address);
            async move {
                let adapter = match self.adapters.get(&chain_id) {
                    Some(adapter) => adapter,
                    None => {
                        let err = AccessError::Validation(format!("chain {chain_id} not configured"));
                        err.log();
                        return Err(err);
                    }
                };
                let result = match self.bulkheads.get(&chain_id) {
                    Some(bulkhead) => bulkhead
                        .execute(|| async { adapter.transactions(&address, opts).await })
                        .await
                        .map_err(AccessError::from)
                        .and_then(|inner| inner.map_err(AccessError::from)),
                    None => adapter.transactions(&address, opts).await.map_err(AccessError::from),
                };
                if let Err(ref err) = result {
                    err.log();
                }
                result
            }
            .instrument(span)
        })
        .await
    }
}
