//! Borealis Wire - Protocol message model
//!
//! - Changed-field flags
//! - Partial aircraft/controller updates and their pure application
//! - The closed set of message kinds carried inside envelopes

pub mod fields;
pub mod update;
pub mod message;

pub use fields::*;
pub use update::*;
pub use message::*;
