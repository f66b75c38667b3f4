//! Service façades: the wiring layer that turns account-attributed batches
//! of address requests into deduplicated calls against chain adapters and
//! DeFi protocol adapters, mirroring the role `web3_proxy::app::Web3ProxyApp`
//! plays in tying the routing core to the frontend.

mod balance;
mod defi;
mod transactions;

pub use balance::BalanceFacade;
pub use defi::DefiFacade;
pub use transactions::TransactionFacade;
