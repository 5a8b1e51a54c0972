//! Envelope transcoder - binds identities, keys and the wire envelope
//!
//! The transcoder holds:
//! - the hub public key (key exchange only)
//! - a symmetric key per local identity
//! - a secondary-recipient table: an id without a key of its own is
//!   addressed with the key of the identity it is aliased to
//!
//! Registries are written during the handshake and on first contact with
//! an unknown entity; every other access is a read.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use borealis_core::{EntityId, SyncError, SyncResult, Timestamp};

use crate::{random_nonce, AeadCipher, Envelope, HubPublicKey, SessionKey};

/// Decoded contents of an envelope
#[derive(Clone, Debug, PartialEq)]
pub struct Unpacked {
    pub sent: Timestamp,
    pub sender: EntityId,
    pub recipient: EntityId,
    pub payload: Value,
}

/// Envelope codec for one tunnel session
#[derive(Default)]
pub struct Transcoder {
    hub_key: RwLock<Option<HubPublicKey>>,
    keys: RwLock<HashMap<EntityId, SessionKey>>,
    /// owner -> identity whose key addresses the owner
    secondary: RwLock<HashMap<EntityId, EntityId>>,
}

impl Transcoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hub public key
    pub fn load_asymmetric_key(&self, key: HubPublicKey) {
        *self.hub_key.write() = Some(key);
    }

    /// Wrap bytes under the hub public key
    pub fn asymmetric_encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let guard = self.hub_key.read();
        let key = guard
            .as_ref()
            .ok_or_else(|| SyncError::Crypto("no hub key loaded".into()))?;
        key.encrypt(plaintext)
    }

    /// Register the symmetric key of an identity
    pub fn register_key(&self, id: EntityId, key: SessionKey) {
        self.keys.write().insert(id, key);
    }

    /// Address `owner` with the key of `alias` from now on
    pub fn register_secondary_recipient(&self, owner: EntityId, alias: EntityId) {
        if owner == alias {
            return;
        }
        tracing::debug!(%owner, %alias, "registered secondary recipient");
        self.secondary.write().insert(owner, alias);
    }

    pub fn has_key(&self, id: EntityId) -> bool {
        self.keys.read().contains_key(&id)
    }

    pub fn secondary_of(&self, owner: EntityId) -> Option<EntityId> {
        self.secondary.read().get(&owner).copied()
    }

    /// Resolve the key addressing `id`: its own, else along the alias chain
    pub fn resolve_key(&self, id: EntityId) -> SyncResult<SessionKey> {
        let keys = self.keys.read();
        let secondary = self.secondary.read();

        let mut current = id;
        let mut visited = HashSet::new();
        loop {
            if let Some(key) = keys.get(&current) {
                return Ok(*key);
            }
            if !visited.insert(current) {
                break;
            }
            match secondary.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }

        Err(SyncError::KeyNotFound(id))
    }

    /// Serialize, encrypt for `recipient` and stamp with the current time
    pub fn pack<T: Serialize + ?Sized>(
        &self,
        sender: EntityId,
        recipient: EntityId,
        payload: &T,
    ) -> SyncResult<String> {
        self.pack_at(Utc::now(), sender, recipient, payload)
    }

    /// Like [`Transcoder::pack`] with an explicit send time
    pub fn pack_at<T: Serialize + ?Sized>(
        &self,
        sent: Timestamp,
        sender: EntityId,
        recipient: EntityId,
        payload: &T,
    ) -> SyncResult<String> {
        let key = self.resolve_key(recipient)?;
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| SyncError::Protocol(format!("payload encoding: {e}")))?;

        let nonce = random_nonce();
        let aad = crate::header_aad(sent, sender, recipient);
        let ciphertext = AeadCipher::new(&key).encrypt(&nonce, &aad, &plaintext)?;

        Envelope::new(sent, sender, recipient, &nonce, &ciphertext).to_frame()
    }

    /// Authenticate and decrypt a text frame
    pub fn unpack(&self, frame: &str) -> SyncResult<Unpacked> {
        let envelope = Envelope::parse(frame)?;
        let key = self.resolve_key(envelope.recipient)?;

        let nonce = envelope.nonce_bytes()?;
        let ciphertext = envelope.ciphertext()?;
        let plaintext = AeadCipher::new(&key).decrypt(&nonce, &envelope.associated_data(), &ciphertext)?;

        let payload = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Crypto(format!("decrypted payload is not JSON: {e}")))?;

        Ok(Unpacked {
            sent: envelope.sent,
            sender: envelope.sender,
            recipient: envelope.recipient,
            payload,
        })
    }
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("hub_key_loaded", &self.hub_key.read().is_some())
            .field("keys", &self.keys.read().len())
            .field("secondary", &self.secondary.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::{generate_key, KEY_SIZE};

    fn ids() -> (EntityId, EntityId, EntityId) {
        (EntityId::from_u128(0xC1), EntityId::from_u128(0x4B), EntityId::from_u128(0xAA))
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let (me, hub, _) = ids();
        let t = Transcoder::new();
        t.register_key(me, generate_key());

        let sent = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let payload = json!({"kind": "kill_message", "victim": hub});
        let frame = t.pack_at(sent, hub, me, &payload).unwrap();

        let out = t.unpack(&frame).unwrap();
        assert_eq!(out.payload, payload);
        assert_eq!(out.sender, hub);
        assert_eq!(out.recipient, me);
        assert_eq!(out.sent, sent);
    }

    #[test]
    fn test_empty_sequence_payload() {
        let (me, _, _) = ids();
        let t = Transcoder::new();
        t.register_key(me, generate_key());

        let frame = t.pack(me, me, &Vec::<Value>::new()).unwrap();
        assert_eq!(t.unpack(&frame).unwrap().payload, json!([]));
    }

    #[test]
    fn test_missing_key() {
        let (me, hub, _) = ids();
        let t = Transcoder::new();

        let result = t.pack(me, hub, &json!([]));
        assert!(matches!(result, Err(SyncError::KeyNotFound(id)) if id == hub));
    }

    #[test]
    fn test_secondary_recipient_chain() {
        let (me, hub, aircraft) = ids();
        let t = Transcoder::new();
        let key = generate_key();
        t.register_key(me, key);
        t.register_secondary_recipient(hub, me);
        t.register_secondary_recipient(aircraft, hub);

        assert_eq!(t.resolve_key(hub).unwrap(), key);
        assert_eq!(t.resolve_key(aircraft).unwrap(), key);

        let frame = t.pack(me, aircraft, &json!({"a": 1})).unwrap();
        assert_eq!(t.unpack(&frame).unwrap().recipient, aircraft);
    }

    #[test]
    fn test_own_key_wins_over_alias() {
        let (me, hub, _) = ids();
        let t = Transcoder::new();
        t.register_key(me, [1u8; KEY_SIZE]);
        t.register_key(hub, [2u8; KEY_SIZE]);
        t.register_secondary_recipient(hub, me);

        assert_eq!(t.resolve_key(hub).unwrap(), [2u8; KEY_SIZE]);
    }

    #[test]
    fn test_alias_cycle_is_key_not_found() {
        let (a, b, _) = ids();
        let t = Transcoder::new();
        t.register_secondary_recipient(a, b);
        t.register_secondary_recipient(b, a);

        assert!(matches!(t.resolve_key(a), Err(SyncError::KeyNotFound(_))));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let (me, hub, _) = ids();
        let t = Transcoder::new();
        let key = generate_key();
        t.register_key(me, key);
        t.register_key(me, key);
        t.register_secondary_recipient(hub, me);
        t.register_secondary_recipient(hub, me);

        assert_eq!(t.secondary_of(hub), Some(me));
        assert_eq!(t.resolve_key(hub).unwrap(), key);
    }

    #[test]
    fn test_wrong_key_is_crypto_error() {
        let (me, hub, _) = ids();
        let sender = Transcoder::new();
        sender.register_key(me, [1u8; KEY_SIZE]);
        let receiver = Transcoder::new();
        receiver.register_key(me, [2u8; KEY_SIZE]);

        let frame = sender.pack(hub, me, &json!([])).unwrap();
        assert!(matches!(receiver.unpack(&frame), Err(SyncError::Crypto(_))));
    }

    #[test]
    fn test_tampered_header_is_crypto_error() {
        let (me, hub, _) = ids();
        let t = Transcoder::new();
        t.register_key(me, generate_key());

        let frame = t.pack(hub, me, &json!({"x": 1})).unwrap();
        let mut env = Envelope::parse(&frame).unwrap();
        env.sender = me;

        assert!(matches!(t.unpack(&env.to_frame().unwrap()), Err(SyncError::Crypto(_))));
    }

    #[test]
    fn test_asymmetric_encrypt_requires_key() {
        let t = Transcoder::new();
        assert!(matches!(t.asymmetric_encrypt(&[0u8; 32]), Err(SyncError::Crypto(_))));
    }

    proptest! {
        #[test]
        fn prop_flipped_ciphertext_byte_never_decodes(index in any::<usize>(), mask in 1u8..=255) {
            let (me, hub, _) = ids();
            let t = Transcoder::new();
            t.register_key(me, [9u8; KEY_SIZE]);

            let frame = t.pack(hub, me, &json!({"kind": "text_message", "text": "hello"})).unwrap();
            let mut env = Envelope::parse(&frame).unwrap();
            let mut ciphertext = env.ciphertext().unwrap();
            let at = index % ciphertext.len();
            ciphertext[at] ^= mask;
            env.payload = STANDARD.encode(&ciphertext);

            let result = t.unpack(&env.to_frame().unwrap());
            prop_assert!(matches!(result, Err(SyncError::Crypto(_))));
        }
    }
}
