//! Facades, ports, error taxonomy, configuration and wiring for the
//! multi-chain access layer, built on the leaf crates in this workspace.
//!
//! Mirrors `web3_proxy`'s split between `app.rs` (wiring), `errors.rs`
//! (taxonomy) and `frontend/` (the user-facing surface) — here the
//! "frontend" is the façade layer in [`facades`] rather than HTTP handlers,
//! since this workspace ships no HTTP surface of its own.

pub mod clock;
pub mod config;
pub mod errors;
pub mod facades;
pub mod layer;
pub mod ports;
pub mod redact;
pub mod telemetry;

pub use clock::{SystemClock, TestClock};
pub use config::RoutingConfig;
pub use errors::AccessError;
pub use layer::AccessLayer;
pub use telemetry::init_tracing;
