//! Borealis Core - Fundamental types shared by every layer
//!
//! This crate defines:
//! - Identities (EntityId)
//! - The replicated entity model (Aircraft, Controller)
//! - Timestamps
//! - The error taxonomy of the sync layer

pub mod id;
pub mod entity;
pub mod error;

pub use id::*;
pub use entity::*;
pub use error::*;
