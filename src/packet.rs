//! WMP Wire Packet
//!
//! Defines the weft mesh protocol (WMP) outer packet: a fixed 29-byte
//! header followed by the payload and an optional trailing signature.
//! All multi-byte integers are big-endian.
//!
//! ## Wire Format
//!
//! ```text
//! offset  size  field
//! 0       1     version (=1)
//! 1       1     type
//! 2       1     ttl
//! 3       8     sender id
//! 11      8     recipient id (all-zero = broadcast)
//! 19      8     timestamp (u64, ms since Unix epoch)
//! 27      2     payload length (u16)
//! 29      N     payload
//! 29+N    0|64  signature (optional)
//! ```
//!
//! The signed region is version | type | sender | recipient (omitted for
//! broadcast) | timestamp | payload | ttl. The ttl participates in the
//! signature but is rewritten on every relay hop, so signatures can only
//! be checked by direct neighbors of the originator.

use crate::identity::{NodeIdentity, ShortId};
use secp256k1::schnorr::Signature;
use secp256k1::{Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// WMP protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 29;

/// Size of the trailing Schnorr signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Hop budget assigned to every locally originated packet.
pub const INITIAL_TTL: u8 = 7;

/// Maximum payload size representable by the 2-byte length field.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Errors that can arise when interpreting packet data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected}, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("payload length {declared} exceeds remaining {remaining} bytes")]
    TruncatedPayload { declared: usize, remaining: usize },

    #[error("payload too large: {0} > {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),
}

/// Outer packet type identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Presence announcement carrying nickname and public keys.
    Announce = 0x01,
    /// Plaintext broadcast chat message.
    Message = 0x02,
    /// Orderly departure; receivers drop the peer and its session.
    Leave = 0x03,
    /// Key-agreement public key exchange.
    Handshake = 0x04,
    /// Authenticated-encrypted container for a typed inner payload.
    Envelope = 0x05,
    /// Metadata announcing a chunked file transfer.
    FileMetadata = 0x06,
    /// One chunk of a larger transfer, file or envelope.
    Fragment = 0x07,
    /// Reserved for future store-and-forward sync.
    SyncRequest = 0x08,
    /// Metadata announcing a chunked oversized envelope.
    EnvelopeMetadata = 0x09,
}

impl PacketType {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PacketType::Announce),
            0x02 => Some(PacketType::Message),
            0x03 => Some(PacketType::Leave),
            0x04 => Some(PacketType::Handshake),
            0x05 => Some(PacketType::Envelope),
            0x06 => Some(PacketType::FileMetadata),
            0x07 => Some(PacketType::Fragment),
            0x08 => Some(PacketType::SyncRequest),
            0x09 => Some(PacketType::EnvelopeMetadata),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Announce => "Announce",
            PacketType::Message => "Message",
            PacketType::Leave => "Leave",
            PacketType::Handshake => "Handshake",
            PacketType::Envelope => "Envelope",
            PacketType::FileMetadata => "FileMetadata",
            PacketType::Fragment => "Fragment",
            PacketType::SyncRequest => "SyncRequest",
            PacketType::EnvelopeMetadata => "EnvelopeMetadata",
        };
        write!(f, "{}", name)
    }
}

/// A decoded WMP packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version, currently 1.
    pub version: u8,
    /// Outer packet type.
    pub packet_type: PacketType,
    /// Remaining hop budget. Decremented on each relay.
    pub ttl: u8,
    /// Originating node.
    pub sender: ShortId,
    /// Addressed node, or None for broadcast (all-zero on the wire).
    pub recipient: Option<ShortId>,
    /// Origination time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Type-specific payload bytes.
    pub payload: Vec<u8>,
    /// Schnorr signature over the signed region, if present.
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Create an unsigned broadcast packet with a fresh hop budget.
    pub fn broadcast(
        packet_type: PacketType,
        sender: ShortId,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl: INITIAL_TTL,
            sender,
            recipient: None,
            timestamp_ms,
            payload,
            signature: None,
        }
    }

    /// Create an unsigned addressed packet with a fresh hop budget.
    pub fn direct(
        packet_type: PacketType,
        sender: ShortId,
        recipient: ShortId,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient: Some(recipient),
            ..Self::broadcast(packet_type, sender, timestamp_ms, payload)
        }
    }

    /// Whether this packet is addressed to every node.
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Serialize the packet to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let sig_len = if self.signature.is_some() {
            SIGNATURE_SIZE
        } else {
            0
        };
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + sig_len);

        buf.push(self.version);
        buf.push(self.packet_type.to_byte());
        buf.push(self.ttl);
        buf.extend_from_slice(self.sender.as_bytes());
        match &self.recipient {
            Some(id) => buf.extend_from_slice(id.as_bytes()),
            None => buf.extend_from_slice(&[0u8; 8]),
        }
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        if let Some(sig) = &self.signature {
            buf.extend_from_slice(sig);
        }

        buf
    }

    /// Parse a packet from wire bytes.
    ///
    /// Requires at least the fixed header. A declared payload length that
    /// exceeds the remaining buffer is an error. If exactly 64 bytes remain
    /// after the payload they are taken as the signature; any other trailer
    /// is ignored.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let packet_type =
            PacketType::from_byte(data[1]).ok_or(PacketError::UnknownType(data[1]))?;
        let ttl = data[2];

        let sender = ShortId::from_bytes(data[3..11].try_into().expect("8-byte slice"));
        let recipient_bytes: [u8; 8] = data[11..19].try_into().expect("8-byte slice");
        let recipient = if recipient_bytes == [0u8; 8] {
            None
        } else {
            Some(ShortId::from_bytes(recipient_bytes))
        };

        let timestamp_ms = u64::from_be_bytes(data[19..27].try_into().expect("8-byte slice"));
        let payload_len = u16::from_be_bytes([data[27], data[28]]) as usize;

        let remaining = data.len() - HEADER_SIZE;
        if payload_len > remaining {
            return Err(PacketError::TruncatedPayload {
                declared: payload_len,
                remaining,
            });
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();

        let trailer = &data[HEADER_SIZE + payload_len..];
        let signature = if trailer.len() == SIGNATURE_SIZE {
            let mut sig = [0u8; SIGNATURE_SIZE];
            sig.copy_from_slice(trailer);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            version,
            packet_type,
            ttl,
            sender,
            recipient,
            timestamp_ms,
            payload,
            signature,
        })
    }

    /// Assemble the signed region.
    ///
    /// version | type | sender | recipient (omitted for broadcast) |
    /// timestamp | payload | ttl. The ttl sits at the end so that the rest
    /// of the region matches the header byte order.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.version);
        buf.push(self.packet_type.to_byte());
        buf.extend_from_slice(self.sender.as_bytes());
        if let Some(id) = &self.recipient {
            buf.extend_from_slice(id.as_bytes());
        }
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.push(self.ttl);
        buf
    }

    /// Sign the packet with the identity's signing key.
    pub fn sign(&mut self, identity: &NodeIdentity) {
        let sig = identity.sign(&self.signed_bytes());
        self.signature = Some(sig.serialize());
    }

    /// Verify the signature against a signing public key.
    ///
    /// Returns false for unsigned packets. Only meaningful when the packet
    /// arrived directly from the originator: relay hops rewrite the ttl,
    /// which is part of the signed region.
    pub fn verify(&self, signing_key: &XOnlyPublicKey) -> bool {
        let Some(sig_bytes) = &self.signature else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig_bytes) else {
            return false;
        };

        let digest: [u8; 32] = Sha256::digest(self.signed_bytes()).into();
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &digest, signing_key).is_ok()
    }
}
