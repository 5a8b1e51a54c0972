//! Key exchange with the hub
//!
//! The hub opens the tunnel with a plaintext line
//! `{client guid}|{base64 modulus}|{base64 exponent}`. The client answers
//! with its session key wrapped under that RSA public key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha2::Sha256;

use borealis_core::{EntityId, SyncError, SyncResult};

/// Field separator of the opening line
pub const HANDSHAKE_SEPARATOR: char = '|';

/// Hub public key used only to wrap the session key
#[derive(Clone, Debug)]
pub struct HubPublicKey {
    key: RsaPublicKey,
}

impl HubPublicKey {
    /// Build from big-endian modulus and exponent bytes
    pub fn from_components(modulus: &[u8], exponent: &[u8]) -> SyncResult<Self> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from_bytes_be(exponent),
        )
        .map_err(|e| SyncError::Crypto(format!("invalid hub key: {e}")))?;

        Ok(HubPublicKey { key })
    }

    /// Build from the base64 fields of the opening line
    pub fn from_base64(modulus: &str, exponent: &str) -> SyncResult<Self> {
        let modulus = STANDARD
            .decode(modulus.trim())
            .map_err(|e| SyncError::Crypto(format!("bad modulus encoding: {e}")))?;
        let exponent = STANDARD
            .decode(exponent.trim())
            .map_err(|e| SyncError::Crypto(format!("bad exponent encoding: {e}")))?;

        Self::from_components(&modulus, &exponent)
    }

    /// Wrap bytes for transport to the hub
    pub fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| SyncError::Crypto(format!("key wrap failed: {e}")))
    }

    pub fn inner(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl From<RsaPublicKey> for HubPublicKey {
    fn from(key: RsaPublicKey) -> Self {
        HubPublicKey { key }
    }
}

/// Parsed opening line of the handshake
#[derive(Clone, Debug)]
pub struct HandshakeOffer {
    /// Identity the hub assigned to this client
    pub client_id: EntityId,
    pub hub_key: HubPublicKey,
}

impl HandshakeOffer {
    /// Parse `"{guid}|{modulus}|{exponent}"`
    pub fn parse(line: &str) -> SyncResult<Self> {
        let fields: Vec<&str> = line.split(HANDSHAKE_SEPARATOR).collect();
        let [id, modulus, exponent] = fields.as_slice() else {
            return Err(SyncError::Handshake(format!(
                "expected 3 fields in opening line, got {}",
                fields.len()
            )));
        };

        let client_id = id
            .parse::<EntityId>()
            .map_err(|e| SyncError::Handshake(format!("bad client id: {e}")))?;
        let hub_key = HubPublicKey::from_base64(modulus, exponent)
            .map_err(|e| SyncError::Handshake(e.to_string()))?;

        Ok(HandshakeOffer { client_id, hub_key })
    }

    /// Render an opening line; the hub side of the exchange
    pub fn format(client_id: EntityId, key: &RsaPublicKey) -> String {
        use rsa::traits::PublicKeyParts;

        format!(
            "{}{sep}{}{sep}{}",
            client_id,
            STANDARD.encode(key.n().to_bytes_be()),
            STANDARD.encode(key.e().to_bytes_be()),
            sep = HANDSHAKE_SEPARATOR
        )
    }
}
