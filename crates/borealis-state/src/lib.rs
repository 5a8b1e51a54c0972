//! Borealis State - Local replica of the hub's entities
//!
//! This crate implements the entity store:
//! - Concurrent id-keyed collections of aircraft and controllers
//! - Per-group merge of partial updates
//! - Bulk application of authoritative snapshots
//! - Change notification
//! - Dead-reckoning extrapolation on the read path

pub mod change;
pub mod extrapolate;
pub mod store;
pub mod reconcile;

pub use change::*;
pub use extrapolate::*;
pub use store::*;
pub use reconcile::*;
