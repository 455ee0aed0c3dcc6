//! weft: flood-routed mesh messaging for short-range radio links
//!
//! A peer-to-peer mesh core: nodes discover each other through announce
//! packets, relay traffic for each other with a ttl-bounded jittered
//! flood, exchange end-to-end encrypted messages over pairwise sessions,
//! and move files and oversized payloads as paced chunk streams. The
//! radio itself stays behind the `LinkDriver` seam; a UDP stand-in ships
//! for development.

pub mod chunker;
pub mod config;
pub mod dedup;
pub mod event;
pub mod identity;
pub mod keystore;
pub mod link;
pub mod node;
pub mod packet;
pub mod peer;
pub mod relay;
pub mod session;
pub mod tlv;

// Re-export identity types
pub use identity::{fingerprint, IdentityError, NodeIdentity, ShortId};

// Re-export config types
pub use config::{Config, ConfigError};

// Re-export packet types
pub use packet::{Packet, PacketError, PacketType, INITIAL_TTL, PROTOCOL_VERSION};

// Re-export TLV payload types
pub use tlv::{
    Announce, AppMessage, AppResponse, EnvelopeKind, FileMetadata, Fragment, PrivateMessage,
    TlvError, TlvReader, TlvRecord, TlvWriter, TransferMetadata,
};

// Re-export session types
pub use session::{CryptoError, SessionKey, SessionStore};

// Re-export peer types
pub use peer::{Peer, PeerDirectory};

// Re-export dedup types
pub use dedup::{dedup_key, DedupCache};

// Re-export relay types
pub use relay::{RelayPlan, RELAY_JITTER_MAX_MS, RELAY_JITTER_MIN_MS};

// Re-export chunker types
pub use chunker::{CompletedTransfer, ReassemblyTable, TransferError};

// Re-export event types
pub use event::{event_channel, Event, EventRx, EventTx};

// Re-export link types
pub use link::{
    link_event_channel, LinkDriver, LinkError, LinkEvent, LinkEventRx, LinkEventTx, LinkId,
    UdpLink, UdpLinkConfig, CHARACTERISTIC_ID, SERVICE_ID,
};

// Re-export keystore types
pub use keystore::{FileKeyStore, KeyStoreError, MemoryKeyStore, SecretStore};

// Re-export node types
pub use node::{Node, NodeError, NodeHandle, NodeState};
