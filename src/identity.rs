//! Node Identity
//!
//! Each node carries two static secp256k1 keypairs: an ECDH key-agreement
//! pair whose public key travels as the 33-byte compressed encoding, and a
//! BIP340 Schnorr signing pair whose public key travels x-only (32 bytes).
//! The node's short identifier is the first 8 bytes of SHA-256 over the
//! compressed key-agreement public key, so the identifier is deterministic
//! from the key and stable across runs.

use crate::keystore::{KeyStoreError, SecretStore};
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Secret-store key for the static key-agreement secret.
pub const AGREEMENT_KEY_NAME: &str = "mesh.privateKey";

/// Secret-store key for the signing secret.
pub const SIGNING_KEY_NAME: &str = "mesh.signingKey";

/// Nickname used before the operator picks one.
pub const DEFAULT_NICKNAME: &str = "anon";

/// Wire size of a compressed key-agreement public key.
pub const AGREEMENT_PUBKEY_SIZE: usize = 33;

/// Wire size of an x-only signing public key.
pub const SIGNING_PUBKEY_SIZE: usize = 32;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(#[from] secp256k1::Error),

    #[error("invalid short id length: expected 8, got {0}")]
    InvalidShortIdLength(usize),

    #[error("invalid short id hex: {0}")]
    InvalidShortIdHex(String),

    #[error("stored key has wrong length: expected 32, got {0}")]
    StoredKeyLength(usize),

    #[error("keystore error: {0}")]
    KeyStore(#[from] KeyStoreError),
}

/// 8-byte node identifier derived from SHA-256 of the key-agreement
/// public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortId([u8; 8]);

impl ShortId {
    /// Create a ShortId from an 8-byte array.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create a ShortId from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != 8 {
            return Err(IdentityError::InvalidShortIdLength(slice.len()));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Parse a ShortId from its 16-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidShortIdHex(s.into()))?;
        Self::from_slice(&bytes)
    }

    /// Derive a ShortId from a key-agreement public key.
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        let hash = Sha256::digest(pubkey.serialize());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[..8]);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Return the lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortId({})", self.to_hex())
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for ShortId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hex fingerprint of a key-agreement public key: SHA-256 over the
/// compressed encoding.
pub fn fingerprint(pubkey: &PublicKey) -> String {
    hex::encode(Sha256::digest(pubkey.serialize()))
}

/// A node identity: the two static keypairs, the derived short id, and
/// the mutable nickname.
pub struct NodeIdentity {
    agreement_secret: SecretKey,
    agreement_public: PublicKey,
    signing: Keypair,
    short_id: ShortId,
    nickname: String,
}

impl NodeIdentity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let agreement_secret = SecretKey::new(&mut rand::thread_rng());
        let signing = Keypair::new(&secp, &mut rand::thread_rng());
        Self::assemble(agreement_secret, signing)
    }

    /// Reconstruct an identity from stored secret key bytes.
    pub fn from_secret_bytes(
        agreement: &[u8; 32],
        signing: &[u8; 32],
    ) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let agreement_secret = SecretKey::from_slice(agreement)?;
        let signing_secret = SecretKey::from_slice(signing)?;
        let signing = Keypair::from_secret_key(&secp, &signing_secret);
        Ok(Self::assemble(agreement_secret, signing))
    }

    fn assemble(agreement_secret: SecretKey, signing: Keypair) -> Self {
        let secp = Secp256k1::new();
        let agreement_public = agreement_secret.public_key(&secp);
        let short_id = ShortId::from_pubkey(&agreement_public);
        Self {
            agreement_secret,
            agreement_public,
            signing,
            short_id,
            nickname: DEFAULT_NICKNAME.to_string(),
        }
    }

    /// Load the identity from a secret store, generating and persisting a
    /// fresh one on first run.
    pub fn load_or_generate(store: &mut dyn SecretStore) -> Result<Self, IdentityError> {
        let agreement = store.get(AGREEMENT_KEY_NAME)?;
        let signing = store.get(SIGNING_KEY_NAME)?;

        match (agreement, signing) {
            (Some(a), Some(s)) => {
                let a: [u8; 32] = a
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::StoredKeyLength(a.len()))?;
                let s: [u8; 32] = s
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::StoredKeyLength(s.len()))?;
                Self::from_secret_bytes(&a, &s)
            }
            _ => {
                let identity = Self::generate();
                store.put(AGREEMENT_KEY_NAME, &identity.agreement_secret.secret_bytes())?;
                store.put(SIGNING_KEY_NAME, &identity.signing.secret_bytes())?;
                Ok(identity)
            }
        }
    }

    /// The static key-agreement public key.
    pub fn agreement_public(&self) -> PublicKey {
        self.agreement_public
    }

    /// The static key-agreement secret key.
    pub fn agreement_secret(&self) -> &SecretKey {
        &self.agreement_secret
    }

    /// The x-only signing public key.
    pub fn signing_public(&self) -> XOnlyPublicKey {
        self.signing.x_only_public_key().0
    }

    /// The node's short identifier.
    pub fn short_id(&self) -> ShortId {
        self.short_id
    }

    /// Hex fingerprint of the key-agreement public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.agreement_public)
    }

    /// The current nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Replace the nickname.
    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }

    /// Sign arbitrary data: SHA-256 digest, then BIP340 Schnorr.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let secp = Secp256k1::new();
        let digest: [u8; 32] = Sha256::digest(data).into();
        secp.sign_schnorr(&digest, &self.signing)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("short_id", &self.short_id)
            .field("nickname", &self.nickname)
            .finish_non_exhaustive()
    }
}
