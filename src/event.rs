//! Host-Facing Events
//!
//! Everything the node wants the host application to know travels as one
//! `Event` value on a bounded channel. The host awaits the receiver; the
//! node never blocks on a slow host — when the channel is full the event
//! is dropped with a warning.

use crate::identity::ShortId;
use crate::link::LinkId;
use crate::peer::Peer;
use tokio::sync::mpsc;

/// Channel sender for node events.
pub type EventTx = mpsc::Sender<Event>;

/// Channel receiver for node events.
pub type EventRx = mpsc::Receiver<Event>;

/// Create an event channel with the given buffer size.
pub fn event_channel(buffer: usize) -> (EventTx, EventRx) {
    mpsc::channel(buffer)
}

/// An event emitted by the node.
#[derive(Clone, Debug)]
pub enum Event {
    /// The set of known peers changed. Carries a snapshot.
    PeerListUpdated { peers: Vec<Peer> },

    /// A chat message arrived, broadcast or private.
    MessageReceived {
        /// Message id: the sender's id for private messages, freshly
        /// generated for broadcasts.
        id: String,
        sender: ShortId,
        sender_nickname: String,
        content: String,
        timestamp_ms: u64,
        is_private: bool,
    },

    /// A chunked file transfer completed.
    FileReceived {
        file_name: String,
        file_size: u32,
        mime_type: String,
        /// Hex short id of the sending node.
        sender: String,
        timestamp_ms: u64,
        /// The reassembled bytes, base64-encoded.
        data: String,
    },

    /// An application message arrived inside an envelope.
    AppMessageReceived {
        id: String,
        kind: String,
        body: Vec<u8>,
        sender: ShortId,
    },

    /// A response to an application message arrived.
    AppResponseReceived {
        id: String,
        payload: Option<Vec<u8>>,
        error: Option<String>,
        sender: ShortId,
    },

    /// A link came up or went down.
    ConnectionStateChanged { link: LinkId, up: bool },

    /// A peer read one of our messages.
    ReadReceipt { message_id: String, sender: ShortId },

    /// A peer's node received one of our messages.
    DeliveryAck { message_id: String, sender: ShortId },

    /// A non-fatal failure the host should know about.
    Error { code: String, message: String },
}

impl Event {
    /// Stable code string for logging and host-side switching.
    pub fn name(&self) -> &'static str {
        match self {
            Event::PeerListUpdated { .. } => "peer-list-updated",
            Event::MessageReceived { .. } => "message-received",
            Event::FileReceived { .. } => "file-received",
            Event::AppMessageReceived { .. } => "application-message-received",
            Event::AppResponseReceived { .. } => "application-response-received",
            Event::ConnectionStateChanged { .. } => "connection-state-changed",
            Event::ReadReceipt { .. } => "read-receipt",
            Event::DeliveryAck { .. } => "delivery-ack",
            Event::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_events() {
        let (tx, mut rx) = event_channel(4);
        tx.send(Event::ConnectionStateChanged {
            link: LinkId::new(1),
            up: true,
        })
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            Event::ConnectionStateChanged { link, up } => {
                assert_eq!(link, LinkId::new(1));
                assert!(up);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_names() {
        let event = Event::Error {
            code: "link-start".into(),
            message: "bind failed".into(),
        };
        assert_eq!(event.name(), "error");
    }
}
