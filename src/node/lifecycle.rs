//! Node lifecycle: start, stop, and outbound packet framing.

use super::{Node, NodeError, NodeState};
use crate::event::Event;
use crate::identity::ShortId;
use crate::packet::{Packet, PacketType};
use crate::tlv::Announce;
use tracing::{debug, info};

impl Node {
    /// Start the node: bring the link driver up and announce ourselves.
    /// Idempotent while running.
    pub fn start(&mut self, nickname: Option<&str>) -> Result<(), NodeError> {
        if self.state == NodeState::Running {
            return Ok(());
        }

        if let Some(nickname) = nickname {
            self.identity.set_nickname(nickname);
        }

        if let Err(e) = self.driver.start() {
            self.emit(Event::Error {
                code: "link-start".into(),
                message: e.to_string(),
            });
            return Err(e.into());
        }

        self.state = NodeState::Running;
        info!(
            short_id = %self.identity.short_id(),
            nickname = %self.identity.nickname(),
            driver = self.driver.name(),
            "node started"
        );

        self.broadcast_announce();
        Ok(())
    }

    /// Stop the node: a final leave packet, then tear everything down.
    pub fn stop(&mut self) {
        if self.state != NodeState::Running {
            return;
        }

        let frame = self.frame(PacketType::Leave, None, Vec::new());
        self.driver.broadcast(&frame, None);

        // Cancel in-flight relay jitters and fragment pacing loops.
        let _ = self.shutdown_tx.send(true);

        self.driver.stop();
        self.directory.clear();
        self.sessions.clear();
        self.reassembly.clear();
        self.dedup.clear();
        self.handshakes_sent.clear();

        self.state = NodeState::Stopped;
        info!(short_id = %self.identity.short_id(), "node stopped");
    }

    /// Build, stamp, and sign one outbound packet.
    pub(crate) fn frame(
        &mut self,
        packet_type: PacketType,
        recipient: Option<ShortId>,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        let timestamp = self.next_timestamp();
        let sender = self.identity.short_id();
        let mut packet = match recipient {
            Some(recipient) => {
                Packet::direct(packet_type, sender, recipient, timestamp, payload)
            }
            None => Packet::broadcast(packet_type, sender, timestamp, payload),
        };
        packet.sign(&self.identity);
        packet.encode()
    }

    /// The announce payload for the current identity.
    pub(crate) fn announce_payload(&self) -> Vec<u8> {
        Announce {
            nickname: self.identity.nickname().to_string(),
            agreement_key: self.identity.agreement_public().serialize().to_vec(),
            signing_key: self.identity.signing_public().serialize().to_vec(),
        }
        .encode()
    }

    /// Announce ourselves to the whole mesh.
    pub(crate) fn broadcast_announce(&mut self) {
        let payload = self.announce_payload();
        let frame = self.frame(PacketType::Announce, None, payload);
        self.driver.broadcast(&frame, None);
        debug!("announce broadcast");
    }
}
