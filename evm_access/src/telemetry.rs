//! Process-wide logging init, mirroring how `web3_proxy`'s binary wires
//! `tracing_subscriber` with an `EnvFilter` before building `Web3ProxyApp`.
//! This crate ships no binary of its own, so the embedding application
//! decides whether and when to call this; nothing else in the workspace
//! depends on it.

use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber::fmt` subscriber filtered by `RUST_LOG`
/// (defaulting to `info`) as the global default. Safe to call once at
/// process startup; a second call is a no-op error that this function
/// swallows, since re-initializing logging is never a reason to panic.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
