//! AEAD encryption using ChaCha20-Poly1305

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};

use borealis_core::{SyncError, SyncResult};

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Symmetric session key
pub type SessionKey = [u8; KEY_SIZE];

/// Generate a fresh random session key
pub fn generate_key() -> SessionKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Random nonce, one per envelope
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// AEAD cipher wrapper
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Create a new cipher from key bytes
    pub fn new(key: &SessionKey) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        AeadCipher { cipher }
    }

    /// Encrypt plaintext with associated data
    /// Returns ciphertext with appended auth tag
    pub fn encrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);

        self.cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| SyncError::Crypto("encryption failed".into()))
    }

    /// Decrypt ciphertext with associated data
    /// Ciphertext should include the auth tag at the end
    pub fn decrypt(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], ciphertext: &[u8]) -> SyncResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(SyncError::Crypto(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let nonce = Nonce::from_slice(nonce);

        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| SyncError::Crypto("authentication failed".into()))
    }
}
