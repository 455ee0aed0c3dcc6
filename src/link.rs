//! Link Layer Abstractions
//!
//! The mesh core is radio-agnostic: it talks to neighbors through the
//! `LinkDriver` trait and hears from them through a channel of
//! `LinkEvent`s. A link is one duplex neighbor connection, identified by
//! an opaque `LinkId`; the driver owns the mapping from links to whatever
//! addressing its medium uses.
//!
//! Drivers must queue writes per neighbor — only one write may be in
//! flight per link — and must deliver inbound frames, link establishment,
//! and link loss on the event channel. `send` enqueues and returns; radio
//! backpressure is absorbed by the per-neighbor queue.

pub mod udp;

pub use udp::{UdpLink, UdpLinkConfig};

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Service identifier advertised by the radio layer.
///
/// Debug and release builds advertise different identifiers so test
/// meshes never bleed into production ones.
pub const SERVICE_ID: &str = if cfg!(debug_assertions) {
    "7b1e6f2a-9c41-4d8e-b3a5-02d6f1c0de09"
} else {
    "a63f5b8c-1d27-4e9a-8f40-73b9e5a2c611"
};

/// Characteristic identifier for the mesh data stream.
pub const CHARACTERISTIC_ID: &str = if cfg!(debug_assertions) {
    "4c9a0d3e-6b52-47f1-9e88-b510c7a4f322"
} else {
    "e82d4a19-3c65-40b7-a2df-58c1094be733"
};

/// Unique identifier for one neighbor link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Create a new link ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link:{}", self.0)
    }
}

/// Something the link layer tells the core.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A neighbor became reachable.
    Up(LinkId),
    /// A neighbor was lost.
    Down(LinkId),
    /// Bytes arrived from a neighbor.
    Frame { link: LinkId, data: Vec<u8> },
}

/// Channel sender for link events.
pub type LinkEventTx = mpsc::Sender<LinkEvent>;

/// Channel receiver for link events.
pub type LinkEventRx = mpsc::Receiver<LinkEvent>;

/// Create a link event channel with the given buffer size.
pub fn link_event_channel(buffer: usize) -> (LinkEventTx, LinkEventRx) {
    mpsc::channel(buffer)
}

/// Errors related to link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link driver not started")]
    NotStarted,

    #[error("link driver already started")]
    AlreadyStarted,

    #[error("link driver failed to start: {0}")]
    StartFailed(String),

    #[error("unknown link: {0}")]
    UnknownLink(LinkId),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("write queue full for {0}")]
    QueueFull(LinkId),

    #[error("frame exceeds mtu: {frame_size} > {mtu}")]
    MtuExceeded { frame_size: usize, mtu: u16 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A duplex neighbor transport: the radio, or a stand-in for it.
///
/// Implementations are driven from inside a tokio runtime. `send` is a
/// synchronous enqueue onto the per-neighbor write queue.
pub trait LinkDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &'static str;

    /// Begin scanning/advertising and accept neighbor traffic.
    fn start(&self) -> Result<(), LinkError>;

    /// Tear down all links and stop.
    fn stop(&self);

    /// Currently active links.
    fn links(&self) -> Vec<LinkId>;

    /// Enqueue a frame to one neighbor.
    fn send(&self, link: LinkId, frame: &[u8]) -> Result<(), LinkError>;

    /// Enqueue a frame to every active neighbor except `exclude`.
    /// Per-link failures are skipped; flooding is loss-tolerant.
    fn broadcast(&self, frame: &[u8], exclude: Option<LinkId>) {
        for link in self.links() {
            if Some(link) == exclude {
                continue;
            }
            if let Err(e) = self.send(link, frame) {
                tracing::debug!(link = %link, error = %e, "broadcast send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_display() {
        assert_eq!(LinkId::new(7).to_string(), "link:7");
        assert_eq!(LinkId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_service_ids_differ_per_profile() {
        assert_ne!(SERVICE_ID, CHARACTERISTIC_ID);
        // Both are 128-bit UUID strings
        assert_eq!(SERVICE_ID.len(), 36);
        assert_eq!(CHARACTERISTIC_ID.len(), 36);
    }

    #[tokio::test]
    async fn test_link_event_channel() {
        let (tx, mut rx) = link_event_channel(8);
        tx.send(LinkEvent::Up(LinkId::new(1))).await.unwrap();
        tx.send(LinkEvent::Frame {
            link: LinkId::new(1),
            data: vec![1, 2, 3],
        })
        .await
        .unwrap();

        assert!(matches!(rx.recv().await, Some(LinkEvent::Up(_))));
        match rx.recv().await {
            Some(LinkEvent::Frame { link, data }) => {
                assert_eq!(link, LinkId::new(1));
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
