//! Error types for the sync layer

use thiserror::Error;

use crate::EntityId;

/// Core sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    // Session errors
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Session is not active")]
    NotActive,

    #[error("Not configured: {0}")]
    NotConfigured(String),

    // Crypto errors
    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("No key resolves for {0}")]
    KeyNotFound(EntityId),

    // Protocol errors
    #[error("Malformed message: {0}")]
    Protocol(String),

    #[error("Unsupported protocol message: {0}")]
    UnsupportedMessageKind(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Errors that only affect the frame they came with
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            SyncError::Crypto(_)
                | SyncError::KeyNotFound(_)
                | SyncError::Protocol(_)
                | SyncError::UnsupportedMessageKind(_)
        )
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
