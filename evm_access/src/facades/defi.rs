use std::sync::Arc;

use crate::errors::AccessError;
use crate::ports::{ChainId, Address, DefiProtocolAdapter, LendingPosition, LiquidityPosition, StakedPosition};

/// Queries every registered protocol adapter that supports a chain and
/// combines the results, applying the partial-failure policy from
/// spec.md §4.9: no applicable protocol is a successful empty list, any
/// one protocol succeeding makes the whole call a success (failing
/// protocols are dropped from the combined list), and only a call where
/// every applicable protocol fails propagates an error, using the first
/// one observed.
pub struct DefiFacade {
    protocols: Vec<Arc<dyn DefiProtocolAdapter>>,
}

impl DefiFacade {
    pub fn new(protocols: Vec<Arc<dyn DefiProtocolAdapter>>) -> Self {
        Self { protocols }
    }

    fn applicable(&self, chain_id: &ChainId) -> Vec<&Arc<dyn DefiProtocolAdapter>> {
        self.protocols.iter().filter(|p| p.supports_chain(chain_id.clone())).collect()
    }

    #[tracing::instrument(skip(self, address), fields(chain_id = %chain_id))]
    pub async fn lending_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<LendingPosition>, AccessError> {
        let applicable = self.applicable(&chain_id);
        if applicable.is_empty() {
            return Ok(Vec::new());
        }

        let mut combined = Vec::new();
        let mut first_error = None;
        let mut any_ok = false;
        for protocol in applicable {
            match protocol.lending_positions(address, chain_id.clone()).await {
                Ok(positions) => {
                    any_ok = true;
                    combined.extend(positions);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if any_ok {
            Ok(combined)
        } else {
            Err(first_error.expect("non-empty applicable list without any_ok has at least one error").into())
        }
    }

    #[tracing::instrument(skip(self, address), fields(chain_id = %chain_id))]
    pub async fn staked_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<StakedPosition>, AccessError> {
        let applicable = self.applicable(&chain_id);
        if applicable.is_empty() {
            return Ok(Vec::new());
        }

        let mut combined = Vec::new();
        let mut first_error = None;
        let mut any_ok = false;
        for protocol in applicable {
            match protocol.staked_positions(address, chain_id.clone()).await {
                Ok(positions) => {
                    any_ok = true;
                    combined.extend(positions);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if any_ok {
            Ok(combined)
        } else {
            Err(first_error.expect("non-empty applicable list without any_ok has at least one error").into())
        }
    }

    #[tracing::instrument(skip(self, address), fields(chain_id = %chain_id))]
    pub async fn liquidity_positions(&self, address: &Address, chain_id: ChainId) -> Result<Vec<LiquidityPosition>, AccessError> {
        let applicable = self.applicable(&chain_id);
        if applicable.is_empty() {
            return Ok(Vec::new());
        }

        let mut combined = Vec::new();
        let mut first_error = None;
        let mut any_ok = false;
        for protocol in applicable {
            match protocol.liquidity_positions(address, chain_id.clone()).await {
                Ok(positions) => {
                    any_ok = true;
                    combined.extend(positions);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if any_ok {
            Ok(combined)
        } else {
            Err(first_error.expect("non-empty applicable list without any_ok has at least one error").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;
    use async_trait::async_trait;

    struct FakeProtocol {
        name: &'static str,
        chains: Vec<ChainId>,
        lending_result: Result<Vec<LendingPosition>, PortError>,
    }

    #[async_trait]
    impl DefiProtocolAdapter for FakeProtocol {
        fn protocol_name(&self) -> &str {
            self.name
        }
        fn supported_chains(&self) -> &[ChainId] {
            &self.chains
        }
        fn supports_chain(&self, chain_id: ChainId) -> bool {
            self.chains.iter().any(|c| *c == chain_id)
        }
        async fn lending_positions(&self, _address: &Address, _chain_id: ChainId) -> Result<Vec<LendingPosition>, PortError> {
            self.lending_result.clone()
        }
        async fn staked_positions(&self, _address: &Address, _chain_id: ChainId) -> Result<Vec<StakedPosition>, PortError> {
            Ok(Vec::new())
        }
        async fn liquidity_positions(&self, _address: &Address, _chain_id: ChainId) -> Result<Vec<LiquidityPosition>, PortError> {
            Ok(Vec::new())
        }
    }

    fn position(protocol: &str) -> LendingPosition {
        LendingPosition { protocol: Arc::from(protocol), asset: Arc::from("USDC"), amount: 100 }
    }

    #[tokio::test]
    async fn no_applicable_protocol_is_empty_success() {
        let facade = DefiFacade::new(vec![]);
        let result = facade.lending_positions(&Arc::from("0xabc"), Arc::from("1")).await;
        assert_eq!(result.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn one_protocol_failing_does_not_fail_the_whole_call() {
        let ok_protocol: Arc<dyn DefiProtocolAdapter> = Arc::new(FakeProtocol {
            name: "aave",
            chains: vec![Arc::from("1")],
            lending_result: Ok(vec![position("aave")]),
        });
        let failing_protocol: Arc<dyn DefiProtocolAdapter> = Arc::new(FakeProtocol {
            name: "compound",
            chains: vec![Arc::from("1")],
            lending_result: Err(PortError::Upstream("rpc down".into())),
        });

        let facade = DefiFacade::new(vec![ok_protocol, failing_protocol]);
        let result = facade.lending_positions(&Arc::from("0xabc"), Arc::from("1")).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].protocol.as_ref(), "aave");
    }

    #[tokio::test]
    async fn every_applicable_protocol_failing_propagates_first_error() {
        let failing_protocol: Arc<dyn DefiProtocolAdapter> = Arc::new(FakeProtocol {
            name: "compound",
            chains: vec![Arc::from("1")],
            lending_result: Err(PortError::Upstream("rpc down".into())),
        });

        let facade = DefiFacade::new(vec![failing_protocol]);
        let result = facade.lending_positions(&Arc::from("0xabc"), Arc::from("1")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn protocol_not_supporting_chain_is_excluded_from_applicable_set() {
        let other_chain_protocol: Arc<dyn DefiProtocolAdapter> = Arc::new(FakeProtocol {
            name: "aave",
            chains: vec![Arc::from("137")],
            lending_result: Ok(vec![position("aave")]),
        });

        let facade = DefiFacade::new(vec![other_chain_protocol]);
        let result = facade.lending_positions(&Arc::from("0xabc"), Arc::from("1")).await;
        assert_eq!(result.unwrap(), Vec::new());
    }
}
