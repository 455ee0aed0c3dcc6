//! Node event loop and inbound packet handlers.
//!
//! One loop serializes everything that can touch protocol state: frames
//! and link transitions from the driver, commands from handles, and a
//! one-second maintenance tick that expires stalled transfers. Handlers
//! follow the loss-tolerant discipline of the protocol: anything
//! malformed, duplicated, or undecryptable is logged at debug level and
//! dropped, never answered.

use super::{now_ms, Node, NodeError};
use crate::chunker::CompletedTransfer;
use crate::dedup::dedup_key;
use crate::event::Event;
use crate::identity::ShortId;
use crate::link::{LinkEvent, LinkId};
use crate::packet::{Packet, PacketType};
use crate::relay;
use crate::tlv::{
    Announce, AppMessage, AppResponse, EnvelopeKind, FileMetadata, Fragment, PrivateMessage,
    TransferMetadata,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secp256k1::{PublicKey, XOnlyPublicKey};
use std::time::Duration;
use tracing::{debug, info, trace};

impl Node {
    /// Run the event loop until the node stops or every input closes.
    ///
    /// Takes the link and command receivers; the loop can only run once.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        let mut link_rx = self.link_rx.take().ok_or(NodeError::NotRunning)?;
        let mut command_rx = self.command_rx.take().ok_or(NodeError::NotRunning)?;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("node event loop started");

        loop {
            tokio::select! {
                event = link_rx.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => break,
                },
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.maintenance(),
            }
        }

        info!("node event loop stopped");
        Ok(())
    }

    /// Periodic housekeeping from the loop tick.
    fn maintenance(&mut self) {
        let expired = self.reassembly.sweep(now_ms());
        if expired > 0 {
            debug!(count = expired, "expired stalled transfers");
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up(link) => {
                debug!(link = %link, "link up");
                self.emit(Event::ConnectionStateChanged { link, up: true });
                // A fresh neighbor learns us without waiting for our next
                // nickname change.
                if self.is_running() {
                    let payload = self.announce_payload();
                    let frame = self.frame(PacketType::Announce, None, payload);
                    if let Err(e) = self.driver.send(link, &frame) {
                        debug!(link = %link, error = %e, "announce to new link failed");
                    }
                }
            }
            LinkEvent::Down(link) => {
                debug!(link = %link, "link down");
                self.emit(Event::ConnectionStateChanged { link, up: false });
                let affected = self.directory.mark_link_down(link);
                if !affected.is_empty() {
                    self.emit_peer_list();
                }
            }
            LinkEvent::Frame { link, data } => self.handle_frame(link, &data),
        }
    }

    /// Decode, dedup, dispatch, relay. The whole step runs inside the
    /// owning loop, so it is atomic with respect to every other step.
    fn handle_frame(&mut self, link: LinkId, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(link = %link, error = %e, "dropping malformed frame");
                return;
            }
        };

        if !self.dedup.insert(dedup_key(&packet)) {
            trace!(sender = %packet.sender, "duplicate packet");
            return;
        }

        if packet.sender == self.identity.short_id() {
            // Our own flood copy coming back around.
            return;
        }

        self.check_signature(&packet);

        match packet.packet_type {
            PacketType::Announce => self.handle_announce(&packet, link),
            PacketType::Message => self.handle_message(&packet),
            PacketType::Leave => self.handle_leave(&packet),
            PacketType::Handshake => self.handle_handshake(&packet, link),
            PacketType::Envelope => self.handle_envelope(&packet),
            PacketType::FileMetadata => self.handle_file_metadata(&packet),
            PacketType::Fragment => self.handle_fragment(&packet),
            PacketType::EnvelopeMetadata => self.handle_envelope_metadata(&packet),
            PacketType::SyncRequest => {
                trace!(sender = %packet.sender, "reserved packet type, ignoring");
            }
        }

        if let Some(plan) = relay::plan(&packet, Some(link)) {
            relay::schedule(plan, self.driver.clone(), self.shutdown_tx.subscribe());
        }
    }

    /// Best-effort signature check. Relay hops rewrite the ttl inside the
    /// signed region, so failure downgrades to a log line; only a direct
    /// neighbor's packet can verify.
    fn check_signature(&self, packet: &Packet) {
        if packet.signature.is_none() {
            return;
        }
        let Some(key) = self.directory.get(&packet.sender).and_then(|p| p.signing_key) else {
            return;
        };
        if !packet.verify(&key) {
            trace!(
                sender = %packet.sender,
                packet_type = %packet.packet_type,
                "signature not verifiable (relayed or forged)"
            );
        }
    }

    // === Type handlers ===

    fn handle_announce(&mut self, packet: &Packet, link: LinkId) {
        let announce = match Announce::decode(&packet.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(sender = %packet.sender, error = %e, "bad announce payload");
                return;
            }
        };

        let agreement_key = match PublicKey::from_slice(&announce.agreement_key) {
            Ok(key) => key,
            Err(_) => {
                debug!(sender = %packet.sender, "announce carries invalid agreement key");
                return;
            }
        };

        // The short id is a commitment to the agreement key; a mismatch is
        // a spoofed announce.
        if ShortId::from_pubkey(&agreement_key) != packet.sender {
            debug!(sender = %packet.sender, "announce key does not match sender id");
            return;
        }

        let signing_key = XOnlyPublicKey::from_slice(&announce.signing_key).ok();

        self.directory.upsert_announce(
            packet.sender,
            announce.nickname,
            Some(agreement_key),
            signing_key,
            Some(link),
            now_ms(),
        );
        self.emit_peer_list();
    }

    fn handle_message(&mut self, packet: &Packet) {
        let content = match std::str::from_utf8(&packet.payload) {
            Ok(content) => content.to_string(),
            Err(_) => {
                debug!(sender = %packet.sender, "non-utf8 broadcast message");
                return;
            }
        };

        self.emit(Event::MessageReceived {
            id: super::commands::new_message_id(),
            sender: packet.sender,
            sender_nickname: self.directory.display_name(&packet.sender),
            content,
            timestamp_ms: packet.timestamp_ms,
            is_private: false,
        });
    }

    fn handle_leave(&mut self, packet: &Packet) {
        let removed = self.directory.remove(&packet.sender).is_some();
        self.sessions.remove(&packet.sender);
        self.handshakes_sent.remove(&packet.sender);
        if removed {
            info!(peer = %packet.sender, "peer left");
            self.emit_peer_list();
        }
    }

    fn handle_handshake(&mut self, packet: &Packet, link: LinkId) {
        // Handshakes addressed to a third node are relayed, not consumed.
        if let Some(recipient) = packet.recipient {
            if recipient != self.identity.short_id() {
                return;
            }
        }

        if let Err(e) = self.sessions.establish(packet.sender, &packet.payload) {
            debug!(sender = %packet.sender, error = %e, "handshake key rejected");
            self.emit(Event::Error {
                code: "handshake-failed".into(),
                message: format!("handshake from {}: {}", packet.sender, e),
            });
            return;
        }

        self.directory.touch(packet.sender, Some(link), now_ms());
        info!(peer = %packet.sender, "session established");

        if !self.handshakes_sent.contains(&packet.sender) {
            self.send_handshake(packet.sender);
        }
    }

    fn handle_envelope(&mut self, packet: &Packet) {
        if let Some(recipient) = packet.recipient {
            if recipient != self.identity.short_id() {
                // Not ours to open; the relay path still floods it on.
                return;
            }
        }

        match self.sessions.decrypt_from(&packet.sender, &packet.payload) {
            Ok((kind, body)) => {
                self.dispatch_plaintext(packet.sender, kind, &body, packet.timestamp_ms)
            }
            Err(e) => {
                // Expected whenever we lack the session; never answered.
                trace!(sender = %packet.sender, error = %e, "envelope not decryptable");
            }
        }
    }

    fn handle_file_metadata(&mut self, packet: &Packet) {
        let meta = match FileMetadata::decode(&packet.payload) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(sender = %packet.sender, error = %e, "bad file metadata");
                return;
            }
        };

        debug!(
            sender = %packet.sender,
            transfer_id = %meta.transfer_id,
            file = %meta.file_name,
            chunks = meta.total_chunks,
            "file transfer announced"
        );
        self.reassembly.begin_file(meta, packet.sender, now_ms());
    }

    fn handle_fragment(&mut self, packet: &Packet) {
        let fragment = match Fragment::decode(&packet.payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                debug!(sender = %packet.sender, error = %e, "bad fragment payload");
                return;
            }
        };

        if !self.reassembly.knows(&fragment.transfer_id) {
            debug!(
                sender = %packet.sender,
                transfer_id = %fragment.transfer_id,
                "fragment for unknown transfer, dropping"
            );
            return;
        }

        match self.reassembly.insert_fragment(fragment) {
            Some(CompletedTransfer::File {
                sender,
                file_name,
                file_size,
                mime_type,
                data,
            }) => {
                info!(file = %file_name, bytes = data.len(), "file received");
                self.emit(Event::FileReceived {
                    file_name,
                    file_size,
                    mime_type,
                    sender: sender.to_hex(),
                    timestamp_ms: now_ms(),
                    data: BASE64.encode(&data),
                });
            }
            Some(CompletedTransfer::Envelope { sender, data }) => {
                // The reassembled buffer is an envelope payload from the
                // transfer's announced sender.
                match self.sessions.decrypt_from(&sender, &data) {
                    Ok((kind, body)) => self.dispatch_plaintext(sender, kind, &body, now_ms()),
                    Err(e) => {
                        trace!(sender = %sender, error = %e, "chunked envelope not decryptable");
                    }
                }
            }
            None => {}
        }
    }

    fn handle_envelope_metadata(&mut self, packet: &Packet) {
        let meta = match TransferMetadata::decode(&packet.payload) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(sender = %packet.sender, error = %e, "bad transfer metadata");
                return;
            }
        };

        debug!(
            sender = %packet.sender,
            transfer_id = %meta.transfer_id,
            chunks = meta.total_chunks,
            "chunked envelope announced"
        );
        self.reassembly.begin_envelope(meta, packet.sender, now_ms());
    }

    // === Inner envelope dispatch ===

    fn dispatch_plaintext(&mut self, sender: ShortId, kind: u8, body: &[u8], timestamp_ms: u64) {
        let Some(kind) = EnvelopeKind::from_byte(kind) else {
            debug!(sender = %sender, kind, "unknown envelope payload kind");
            return;
        };

        match kind {
            EnvelopeKind::PrivateMessage => {
                let message = match PrivateMessage::decode(body) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(sender = %sender, error = %e, "bad private message body");
                        return;
                    }
                };

                self.emit(Event::MessageReceived {
                    id: message.id.clone(),
                    sender,
                    sender_nickname: self.directory.display_name(&sender),
                    content: message.content,
                    timestamp_ms,
                    is_private: true,
                });

                // The sender tracks delivery by message id.
                if let Err(e) =
                    self.send_envelope(sender, EnvelopeKind::DeliveryAck, message.id.as_bytes())
                {
                    debug!(peer = %sender, error = %e, "delivery ack not sent");
                }
            }
            EnvelopeKind::ReadReceipt => match std::str::from_utf8(body) {
                Ok(message_id) => self.emit(Event::ReadReceipt {
                    message_id: message_id.to_string(),
                    sender,
                }),
                Err(_) => debug!(sender = %sender, "non-utf8 read receipt"),
            },
            EnvelopeKind::DeliveryAck => match std::str::from_utf8(body) {
                Ok(message_id) => self.emit(Event::DeliveryAck {
                    message_id: message_id.to_string(),
                    sender,
                }),
                Err(_) => debug!(sender = %sender, "non-utf8 delivery ack"),
            },
            EnvelopeKind::AppMessage => match AppMessage::decode(body) {
                Ok(message) => self.emit(Event::AppMessageReceived {
                    id: message.id,
                    kind: message.kind,
                    body: message.body,
                    sender,
                }),
                Err(e) => debug!(sender = %sender, error = %e, "bad app message body"),
            },
            EnvelopeKind::AppResponse => match AppResponse::decode(body) {
                Ok(response) => self.emit(Event::AppResponseReceived {
                    id: response.id,
                    payload: response.payload,
                    error: response.error,
                    sender,
                }),
                Err(e) => debug!(sender = %sender, error = %e, "bad app response body"),
            },
            EnvelopeKind::FileTransfer
            | EnvelopeKind::VerifyChallenge
            | EnvelopeKind::VerifyResponse => {
                trace!(sender = %sender, kind = %kind, "reserved envelope kind, ignoring");
            }
        }
    }
}
