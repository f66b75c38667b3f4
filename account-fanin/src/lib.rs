//! Dedup + fan-out for account-scoped address queries.
//!
//! Generalizes `deferred-rate-limiter`'s keyed-cache dedup idea to a
//! one-shot batch: many accounts asking for the same (address, chain) pair
//! should cost one underlying query, with every account seeing its own
//! result or error regardless of what happens to its peers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::trace;

pub type AccountId = Arc<str>;

#[derive(Debug, Clone)]
pub struct AddressRequest {
    pub account_id: AccountId,
    pub address: Arc<str>,
    pub chain_scope: Vec<Arc<str>>,
}

#[derive(Debug, Clone)]
pub struct AccountResult<T> {
    pub account_id: AccountId,
    pub address: Arc<str>,
    pub chain_id: Arc<str>,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct AccountError<E> {
    pub account_id: AccountId,
    pub address: Arc<str>,
    pub chain_id: Arc<str>,
    pub error: E,
}

#[derive(Debug, Clone)]
pub struct FanInOutcome<T, E> {
    pub results: Vec<AccountResult<T>>,
    pub errors: Vec<AccountError<E>>,
    pub queries_executed: usize,
}

/// (lowercased address, chain id).
type DedupKey = (Arc<str>, Arc<str>);

/// Expand `requests` across their chain scopes, deduplicate by
/// (lowercase(address), chain), run `query` once per unique key
/// concurrently, and fan results back out to every account that asked for
/// that key.
pub async fn fan_in<T, E, F, Fut>(requests: &[AddressRequest], query: F) -> FanInOutcome<T, E>
where
    T: Clone,
    E: Clone,
    F: Fn(Arc<str>, Arc<str>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut groups: HashMap<DedupKey, (Arc<str>, Arc<str>, Vec<AccountId>)> = HashMap::new();

    for req in requests {
        let lowercase_address: Arc<str> = Arc::from(req.address.to_lowercase());
        for chain_id in &req.chain_scope {
            let key: DedupKey = (lowercase_address.clone(), chain_id.clone());
            let entry = groups.entry(key).or_insert_with(|| (req.address.clone(), chain_id.clone(), Vec::new()));
            entry.2.push(req.account_id.clone());
        }
    }

    trace!(unique_keys = groups.len(), total_requests = requests.len(), "account fan-in deduplicated");

    let queries_executed = groups.len();
    let futures = groups.into_iter().map(|(_key, (address, chain_id, account_ids))| {
        let query_future = query(address.clone(), chain_id.clone());
        async move {
            let outcome = query_future.await;
            (address, chain_id, account_ids, outcome)
        }
    });

    let outcomes = futures::future::join_all(futures).await;

    let mut results = Vec::new();
    let mut errors = Vec::new();

    for (address, chain_id, account_ids, outcome) in outcomes {
        match outcome {
            Ok(value) => {
                for account_id in account_ids {
                    results.push(AccountResult {
                        account_id,
                        address: address.clone(),
                        chain_id: chain_id.clone(),
                        value: value.clone(),
                    });
                }
            }
            Err(error) => {
                for account_id in account_ids {
                    errors.push(AccountError {
                        account_id,
                        address: address.clone(),
                        chain_id: chain_id.clone(),
                        error: error.clone(),
                    });
                }
            }
        }
    }

    FanInOutcome { results, errors, queries_executed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn req(account_id: &str, address: &str, chains: &[&str]) -> AddressRequest {
        AddressRequest {
            account_id: Arc::from(account_id),
            address: Arc::from(address),
            chain_scope: chains.iter().map(|c| Arc::from(*c)).collect(),
        }
    }

    #[tokio::test]
    async fn distinct_accounts_same_address_dedupe_to_one_query() {
        let calls = Arc::new(AtomicUsize::new(0));
        let requests = vec![req("acct-a", "0xABC", &["1"]), req("acct-b", "0xabc", &["1"])];

        let calls_ref = Arc::clone(&calls);
        let outcome = fan_in(&requests, move |_address, _chain| {
            let calls = Arc::clone(&calls_ref);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, String>(42)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.queries_executed, 1);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().any(|r| &*r.account_id == "acct-a"));
        assert!(outcome.results.iter().any(|r| &*r.account_id == "acct-b"));
    }

    #[tokio::test]
    async fn query_failure_fans_out_as_error_to_every_account() {
        let requests = vec![req("acct-a", "0xabc", &["1"]), req("acct-b", "0xabc", &["1"])];

        let outcome = fan_in(&requests, |_address, _chain| async { Err::<u64, String>("rpc down".to_string()) }).await;

        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn one_account_failure_does_not_affect_another_key() {
        let requests = vec![req("acct-a", "0xabc", &["1"]), req("acct-b", "0xdef", &["1"])];

        let outcome = fan_in(&requests, |address, _chain| async move {
            if &*address == "0xabc" {
                Err::<u64, String>("down".to_string())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].value, 7);
    }

    #[tokio::test]
    async fn chain_scope_expands_into_one_key_per_chain() {
        let requests = vec![req("acct-a", "0xabc", &["1", "137"])];

        let outcome = fan_in(&requests, |_address, _chain| async { Ok::<u64, String>(1) }).await;

        assert_eq!(outcome.queries_executed, 2);
        assert_eq!(outcome.results.len(), 2);
    }
}
