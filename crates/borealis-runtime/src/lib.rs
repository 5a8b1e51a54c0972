//! Borealis Runtime - Session orchestration
//!
//! This crate drives a client session against a hub:
//! 1. Open the tunnel
//! 2. Exchange keys (RSA-wrapped session key)
//! 3. Verify the hub's confirmation
//! 4. Install the inbound dispatcher
//! 5. Confirm and announce presence
//! 6. Reconcile every inbound update into the entity store

pub mod config;
pub mod dispatch;
pub mod session;
pub mod telemetry;

pub use config::*;
pub use dispatch::*;
pub use session::*;
pub use telemetry::init_tracing;
