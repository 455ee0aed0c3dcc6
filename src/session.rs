//! Pairwise Encrypted Sessions
//!
//! A session is a 32-byte symmetric key shared with one peer, derived
//! from an ECDH agreement between the two static key-agreement keys:
//!
//! ```text
//!   shared  = ECDH(our_static_secret, their_static_public)
//!   key     = HKDF-SHA256(ikm = shared, info = "mesh-encryption")[0..32]
//! ```
//!
//! Both sides compute the same key, so a handshake in each direction is
//! enough to establish the session without further negotiation.
//!
//! Envelope payloads are sealed with ChaCha20-Poly1305 under a fresh
//! random 96-bit nonce per message; the wire form is nonce followed by
//! ciphertext with the 128-bit tag appended. Sessions are not persisted
//! and die with the process or an explicit leave.

use crate::identity::ShortId;
use crate::tlv::EnvelopeKind;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, SecretKey};
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;

/// HKDF context string binding derived keys to this protocol.
const KDF_CONTEXT: &[u8] = b"mesh-encryption";

/// Size of the AEAD nonce.
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD tag.
pub const TAG_SIZE: usize = 16;

/// Size of a derived session key.
pub const SESSION_KEY_SIZE: usize = 32;

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no session with peer {0}")]
    NoSession(ShortId),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("envelope too short: expected at least {expected}, got {got}")]
    EnvelopeTooShort { expected: usize, got: usize },
}

/// A derived symmetric key for one peer.
#[derive(Clone)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Derive the session key shared with the holder of `their_public`.
    pub fn derive(
        our_secret: &SecretKey,
        their_public: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let shared = SharedSecret::new(their_public, our_secret);
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_ref());

        let mut key = [0u8; SESSION_KEY_SIZE];
        hkdf.expand(KDF_CONTEXT, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self(key))
    }

    /// Construct from raw key bytes.
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Seal a plaintext: fresh random nonce, then nonce || ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload produced by `seal`.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::EnvelopeTooShort {
                expected: NONCE_SIZE + TAG_SIZE,
                got: payload.len(),
            });
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let nonce = Nonce::from_slice(&payload[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &payload[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Sessions established with peers, keyed by short id.
///
/// Owned exclusively by the node task; all mutation happens there.
pub struct SessionStore {
    our_secret: SecretKey,
    sessions: HashMap<ShortId, SessionKey>,
}

impl SessionStore {
    /// Create an empty store bound to our static agreement secret.
    pub fn new(our_secret: SecretKey) -> Self {
        Self {
            our_secret,
            sessions: HashMap::new(),
        }
    }

    /// Derive and remember the session for a peer from their handshake
    /// public key bytes (compressed SEC1 encoding).
    pub fn establish(&mut self, peer: ShortId, their_public: &[u8]) -> Result<(), CryptoError> {
        let pubkey =
            PublicKey::from_slice(their_public).map_err(|_| CryptoError::InvalidPublicKey)?;
        let key = SessionKey::derive(&self.our_secret, &pubkey)?;
        self.sessions.insert(peer, key);
        Ok(())
    }

    /// Whether a session with the peer exists.
    pub fn has(&self, peer: &ShortId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Drop the session for a peer (leave, or operator action).
    pub fn remove(&mut self, peer: &ShortId) -> bool {
        self.sessions.remove(peer).is_some()
    }

    /// Drop every session.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Number of established sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Build an envelope payload for a peer: one kind byte, then the body,
    /// sealed under the session key.
    pub fn encrypt_for(
        &self,
        peer: &ShortId,
        kind: EnvelopeKind,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .sessions
            .get(peer)
            .ok_or(CryptoError::NoSession(*peer))?;

        let mut plaintext = Vec::with_capacity(1 + body.len());
        plaintext.push(kind.to_byte());
        plaintext.extend_from_slice(body);
        key.seal(&plaintext)
    }

    /// Open an envelope payload from a peer, returning the raw kind byte
    /// and the body.
    pub fn decrypt_from(
        &self,
        peer: &ShortId,
        payload: &[u8],
    ) -> Result<(u8, Vec<u8>), CryptoError> {
        let key = self
            .sessions
            .get(peer)
            .ok_or(CryptoError::NoSession(*peer))?;

        let mut plaintext = key.open(payload)?;
        if plaintext.is_empty() {
            return Err(CryptoError::DecryptionFailed);
        }
        let kind = plaintext[0];
        plaintext.remove(0);
        Ok((kind, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;

    fn paired_stores() -> (SessionStore, SessionStore, ShortId, ShortId) {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();

        let mut store_a = SessionStore::new(*a.agreement_secret());
        let mut store_b = SessionStore::new(*b.agreement_secret());

        store_a
            .establish(b.short_id(), &b.agreement_public().serialize())
            .unwrap();
        store_b
            .establish(a.short_id(), &a.agreement_public().serialize())
            .unwrap();

        (store_a, store_b, a.short_id(), b.short_id())
    }

    #[test]
    fn test_derived_keys_are_symmetric() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();

        let key_ab = SessionKey::derive(a.agreement_secret(), &b.agreement_public()).unwrap();
        let key_ba = SessionKey::derive(b.agreement_secret(), &a.agreement_public()).unwrap();

        // Same key on both sides: what A seals, the B-side key opens.
        let sealed = key_ab.seal(b"probe").unwrap();
        assert_eq!(key_ba.open(&sealed).unwrap(), b"probe");
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        let sealed = key.seal(b"the payload").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + b"the payload".len() + TAG_SIZE);
        assert_eq!(key.open(&sealed).unwrap(), b"the payload");
    }

    #[test]
    fn test_nonces_are_fresh_per_seal() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        let other = SessionKey::from_bytes([8u8; SESSION_KEY_SIZE]);

        let sealed = key.seal(b"secret").unwrap();
        assert!(matches!(
            other.open(&sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        let mut sealed = key.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            key.open(&sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_rejects_short_payload() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        assert!(matches!(
            key.open(&[0u8; NONCE_SIZE + TAG_SIZE - 1]),
            Err(CryptoError::EnvelopeTooShort { .. })
        ));
    }

    #[test]
    fn test_store_envelope_roundtrip() {
        let (store_a, store_b, id_a, id_b) = paired_stores();

        let payload = store_a
            .encrypt_for(&id_b, EnvelopeKind::PrivateMessage, b"hello")
            .unwrap();
        let (kind, body) = store_b.decrypt_from(&id_a, &payload).unwrap();

        assert_eq!(kind, EnvelopeKind::PrivateMessage.to_byte());
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_store_no_session() {
        let identity = NodeIdentity::generate();
        let store = SessionStore::new(*identity.agreement_secret());
        let stranger = ShortId::from_bytes([1; 8]);

        assert!(matches!(
            store.encrypt_for(&stranger, EnvelopeKind::DeliveryAck, b"x"),
            Err(CryptoError::NoSession(_))
        ));
        assert!(matches!(
            store.decrypt_from(&stranger, &[0u8; 64]),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn test_store_remove_and_clear() {
        let (mut store_a, _, _, id_b) = paired_stores();

        assert!(store_a.has(&id_b));
        assert!(store_a.remove(&id_b));
        assert!(!store_a.has(&id_b));
        assert!(!store_a.remove(&id_b));

        store_a
            .establish(id_b, &NodeIdentity::generate().agreement_public().serialize())
            .unwrap();
        store_a.clear();
        assert!(store_a.is_empty());
    }

    #[test]
    fn test_establish_rejects_bad_pubkey() {
        let identity = NodeIdentity::generate();
        let mut store = SessionStore::new(*identity.agreement_secret());

        assert!(matches!(
            store.establish(ShortId::from_bytes([1; 8]), &[0u8; 33]),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
