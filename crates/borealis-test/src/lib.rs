//! Borealis Test Harness - Simulated hub and session scenarios
//!
//! This crate provides:
//! - A websocket hub that performs the real key exchange
//! - Recording and decoding of everything a client sends it
//! - End-to-end session scenarios

pub mod hub;

#[cfg(test)]
mod scenarios;

pub use hub::*;
