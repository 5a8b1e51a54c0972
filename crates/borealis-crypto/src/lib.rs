//! Borealis Crypto - Envelope codec for the hub tunnel
//!
//! Provides:
//! - AEAD encryption (ChaCha20-Poly1305)
//! - Hub public key handling for the key exchange (RSA-OAEP)
//! - The wire envelope
//! - The transcoder: per-identity key registry with secondary recipients

pub mod aead;
pub mod handshake;
pub mod envelope;
pub mod transcoder;

pub use aead::*;
pub use handshake::*;
pub use envelope::*;
pub use transcoder::*;
