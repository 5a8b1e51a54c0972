//! Wire envelope - the addressed, encrypted, timestamped unit of the tunnel

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use borealis_core::{EntityId, SyncError, SyncResult, Timestamp};

use crate::NONCE_SIZE;

/// Envelope as it crosses the wire, one per text frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sent: Timestamp,
    pub sender: EntityId,
    pub recipient: EntityId,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext with auth tag
    pub payload: String,
}

impl Envelope {
    pub fn new(
        sent: Timestamp,
        sender: EntityId,
        recipient: EntityId,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Self {
        Envelope {
            sent,
            sender,
            recipient,
            nonce: STANDARD.encode(nonce),
            payload: STANDARD.encode(ciphertext),
        }
    }

    /// Parse a text frame
    pub fn parse(frame: &str) -> SyncResult<Self> {
        serde_json::from_str(frame).map_err(|e| SyncError::Crypto(format!("malformed envelope: {e}")))
    }

    pub fn to_frame(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Crypto(format!("envelope encoding: {e}")))
    }

    /// Header bytes bound into the AEAD tag
    pub fn associated_data(&self) -> Vec<u8> {
        header_aad(self.sent, self.sender, self.recipient)
    }

    pub fn nonce_bytes(&self) -> SyncResult<[u8; NONCE_SIZE]> {
        let raw = STANDARD
            .decode(&self.nonce)
            .map_err(|e| SyncError::Crypto(format!("bad nonce encoding: {e}")))?;

        raw.as_slice()
            .try_into()
            .map_err(|_| SyncError::Crypto(format!("nonce must be {NONCE_SIZE} bytes, got {}", raw.len())))
    }

    pub fn ciphertext(&self) -> SyncResult<Vec<u8>> {
        STANDARD
            .decode(&self.payload)
            .map_err(|e| SyncError::Crypto(format!("bad payload encoding: {e}")))
    }
}

/// Serialize the envelope header for AAD
/// Format: secs(8) | nanos(4) | sender(16) | recipient(16)
pub fn header_aad(sent: Timestamp, sender: EntityId, recipient: EntityId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(44);
    aad.extend_from_slice(&sent.timestamp().to_le_bytes());
    aad.extend_from_slice(&sent.timestamp_subsec_nanos().to_le_bytes());
    aad.extend_from_slice(&sender.to_bytes());
    aad.extend_from_slice(&recipient.to_bytes());
    aad
}
