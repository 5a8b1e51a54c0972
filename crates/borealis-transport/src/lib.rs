//! Borealis Transport Layer - Hub tunnel and discovery
//!
//! This crate provides:
//! - The websocket tunnel carrying envelope frames
//! - Ordered inbound delivery with a one-shot intercept for the handshake
//! - HTTP discovery of available hubs

pub mod discovery;
pub mod tunnel;

pub use discovery::*;
pub use tunnel::*;
