//! Outbound command surface.
//!
//! Hosts drive the node through a `NodeHandle`: each call enqueues a
//! `Command` into the owning loop and resolves once the work has been
//! handed to the link layer (first write enqueued), not once neighbors
//! acknowledge anything — the protocol has no acknowledged transport.

use super::{Node, NodeError};
use crate::chunker::{self, FRAGMENT_PACING_MS, INLINE_CIPHERTEXT_MAX};
use crate::identity::ShortId;
use crate::link::LinkDriver;
use crate::packet::{PacketType, MAX_PAYLOAD_SIZE};
use crate::peer::Peer;
use crate::tlv::{AppMessage, AppResponse, EnvelopeKind, PrivateMessage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Generate a fresh message or transfer id: 8 random bytes, hex.
pub(crate) fn new_message_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Commands processed by the node loop.
pub(super) enum Command {
    SendBroadcast {
        content: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SendPrivate {
        content: String,
        to: ShortId,
        reply: oneshot::Sender<Result<String, NodeError>>,
    },
    SendFile {
        path: PathBuf,
        to: Option<ShortId>,
        reply: oneshot::Sender<Result<String, NodeError>>,
    },
    SendAppMessage {
        id: String,
        kind: String,
        body: Vec<u8>,
        to: ShortId,
        reply: oneshot::Sender<Result<String, NodeError>>,
    },
    RespondAppMessage {
        id: String,
        to: ShortId,
        payload: Option<Vec<u8>>,
        error: Option<String>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SendReadReceipt {
        message_id: String,
        to: ShortId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SetNickname {
        nickname: String,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    GetId {
        reply: oneshot::Sender<ShortId>,
    },
    GetNickname {
        reply: oneshot::Sender<String>,
    },
    GetFingerprint {
        reply: oneshot::Sender<String>,
    },
    GetPeerFingerprint {
        id: ShortId,
        reply: oneshot::Sender<Option<String>>,
    },
    HasSession {
        id: ShortId,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle driving a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    pub(super) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| NodeError::ChannelClosed)?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Broadcast a plaintext chat message to the mesh.
    pub async fn send_broadcast(&self, content: impl Into<String>) -> Result<(), NodeError> {
        let content = content.into();
        self.request(|reply| Command::SendBroadcast { content, reply })
            .await?
    }

    /// Send an encrypted private message. Returns the message id. If no
    /// session exists yet a handshake is sent instead and the call fails
    /// with `SessionNotEstablished`; retry after the session forms.
    pub async fn send_private(
        &self,
        content: impl Into<String>,
        to: ShortId,
    ) -> Result<String, NodeError> {
        let content = content.into();
        self.request(|reply| Command::SendPrivate { content, to, reply })
            .await?
    }

    /// Read a file and send it chunked. Returns the transfer id.
    pub async fn send_file(
        &self,
        path: impl Into<PathBuf>,
        to: Option<ShortId>,
    ) -> Result<String, NodeError> {
        let path = path.into();
        self.request(|reply| Command::SendFile { path, to, reply })
            .await?
    }

    /// Send an application payload inside an encrypted envelope, chunked
    /// when the ciphertext is oversized. Returns the message id.
    pub async fn send_app_message(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        body: Vec<u8>,
        to: ShortId,
    ) -> Result<String, NodeError> {
        let (id, kind) = (id.into(), kind.into());
        self.request(|reply| Command::SendAppMessage {
            id,
            kind,
            body,
            to,
            reply,
        })
        .await?
    }

    /// Answer an application message: success payload or error text.
    pub async fn respond_app_message(
        &self,
        id: impl Into<String>,
        to: ShortId,
        payload: Option<Vec<u8>>,
        error: Option<String>,
    ) -> Result<(), NodeError> {
        let id = id.into();
        self.request(|reply| Command::RespondAppMessage {
            id,
            to,
            payload,
            error,
            reply,
        })
        .await?
    }

    /// Tell a peer one of their messages was read.
    pub async fn send_read_receipt(
        &self,
        message_id: impl Into<String>,
        to: ShortId,
    ) -> Result<(), NodeError> {
        let message_id = message_id.into();
        self.request(|reply| Command::SendReadReceipt {
            message_id,
            to,
            reply,
        })
        .await?
    }

    /// Change the announced nickname.
    pub async fn set_nickname(&self, nickname: impl Into<String>) -> Result<(), NodeError> {
        let nickname = nickname.into();
        self.request(|reply| Command::SetNickname { nickname, reply })
            .await
    }

    /// Stop the node; the event loop exits after the leave is sent.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Snapshot of the peer directory.
    pub async fn peers(&self) -> Result<Vec<Peer>, NodeError> {
        self.request(|reply| Command::GetPeers { reply }).await
    }

    /// Our short id.
    pub async fn my_id(&self) -> Result<ShortId, NodeError> {
        self.request(|reply| Command::GetId { reply }).await
    }

    /// Our current nickname.
    pub async fn my_nickname(&self) -> Result<String, NodeError> {
        self.request(|reply| Command::GetNickname { reply }).await
    }

    /// Our full identity fingerprint.
    pub async fn fingerprint(&self) -> Result<String, NodeError> {
        self.request(|reply| Command::GetFingerprint { reply }).await
    }

    /// A peer's full fingerprint, when their key is known.
    pub async fn peer_fingerprint(&self, id: ShortId) -> Result<Option<String>, NodeError> {
        self.request(|reply| Command::GetPeerFingerprint { id, reply })
            .await
    }

    /// Whether an encrypted session with the peer exists.
    pub async fn has_session(&self, id: ShortId) -> Result<bool, NodeError> {
        self.request(|reply| Command::HasSession { id, reply }).await
    }
}

impl Node {
    /// Process one command. Returns true when the loop should exit.
    pub(super) async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SendBroadcast { content, reply } => {
                let _ = reply.send(self.send_broadcast_message(&content));
            }
            Command::SendPrivate { content, to, reply } => {
                let _ = reply.send(self.send_private_message(&content, to));
            }
            Command::SendFile { path, to, reply } => {
                let _ = reply.send(self.send_file(&path, to).await);
            }
            Command::SendAppMessage {
                id,
                kind,
                body,
                to,
                reply,
            } => {
                let _ = reply.send(self.send_app_message(id, kind, body, to));
            }
            Command::RespondAppMessage {
                id,
                to,
                payload,
                error,
                reply,
            } => {
                let _ = reply.send(self.respond_app_message(id, to, payload, error));
            }
            Command::SendReadReceipt {
                message_id,
                to,
                reply,
            } => {
                let _ = reply.send(self.send_read_receipt_to(&message_id, to));
            }
            Command::SetNickname { nickname, reply } => {
                self.identity.set_nickname(nickname);
                if self.is_running() {
                    self.broadcast_announce();
                }
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
                return true;
            }
            Command::GetPeers { reply } => {
                let _ = reply.send(self.directory.snapshot());
            }
            Command::GetId { reply } => {
                let _ = reply.send(self.identity.short_id());
            }
            Command::GetNickname { reply } => {
                let _ = reply.send(self.identity.nickname().to_string());
            }
            Command::GetFingerprint { reply } => {
                let _ = reply.send(self.identity.fingerprint());
            }
            Command::GetPeerFingerprint { id, reply } => {
                let _ = reply.send(self.directory.get(&id).and_then(|p| p.fingerprint()));
            }
            Command::HasSession { id, reply } => {
                let _ = reply.send(self.sessions.has(&id));
            }
        }
        false
    }

    // === Outbound operations ===

    fn send_broadcast_message(&mut self, content: &str) -> Result<(), NodeError> {
        self.ensure_running()?;
        if content.len() > MAX_PAYLOAD_SIZE {
            return Err(NodeError::MessageTooLarge(content.len()));
        }

        let frame = self.frame(PacketType::Message, None, content.as_bytes().to_vec());
        self.driver.broadcast(&frame, None);
        Ok(())
    }

    fn send_private_message(&mut self, content: &str, to: ShortId) -> Result<String, NodeError> {
        self.ensure_running()?;
        if !self.sessions.has(&to) {
            self.send_handshake(to);
            return Err(NodeError::SessionNotEstablished(to));
        }

        let message = PrivateMessage {
            id: new_message_id(),
            content: content.to_string(),
        };
        self.send_envelope(to, EnvelopeKind::PrivateMessage, &message.encode())?;
        Ok(message.id)
    }

    async fn send_file(&mut self, path: &Path, to: Option<ShortId>) -> Result<String, NodeError> {
        self.ensure_running()?;

        let data = tokio::fs::read(path).await.map_err(|source| {
            chunker::TransferError::FileRead {
                path: path.display().to_string(),
                source,
            }
        })?;

        let transfer_id = new_message_id();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let (meta, fragments) =
            chunker::split_file(&transfer_id, &file_name, mime_type_for(path), &data)?;

        info!(
            transfer_id = %transfer_id,
            file = %file_name,
            bytes = data.len(),
            chunks = meta.total_chunks,
            "file transfer starting"
        );

        let meta_frame = self.frame(PacketType::FileMetadata, to, meta.encode());
        self.driver.broadcast(&meta_frame, None);

        let fragment_frames = fragments
            .into_iter()
            .map(|f| self.frame(PacketType::Fragment, to, f.encode()))
            .collect();
        spawn_paced(
            fragment_frames,
            self.driver.clone(),
            self.shutdown_tx.subscribe(),
        );

        Ok(transfer_id)
    }

    fn send_app_message(
        &mut self,
        id: String,
        kind: String,
        body: Vec<u8>,
        to: ShortId,
    ) -> Result<String, NodeError> {
        self.ensure_running()?;
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(NodeError::MessageTooLarge(body.len()));
        }
        if !self.sessions.has(&to) {
            self.send_handshake(to);
            return Err(NodeError::SessionNotEstablished(to));
        }

        let message = AppMessage {
            id: if id.is_empty() { new_message_id() } else { id },
            kind,
            body,
        };
        self.send_envelope(to, EnvelopeKind::AppMessage, &message.encode())?;
        Ok(message.id)
    }

    fn respond_app_message(
        &mut self,
        id: String,
        to: ShortId,
        payload: Option<Vec<u8>>,
        error: Option<String>,
    ) -> Result<(), NodeError> {
        self.ensure_running()?;
        if let Some(payload) = &payload {
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(NodeError::MessageTooLarge(payload.len()));
            }
        }
        let response = AppResponse { id, payload, error };
        self.send_envelope(to, EnvelopeKind::AppResponse, &response.encode())
    }

    fn send_read_receipt_to(&mut self, message_id: &str, to: ShortId) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.send_envelope(to, EnvelopeKind::ReadReceipt, message_id.as_bytes())
    }

    /// Send our key-agreement public key to a peer, flood-addressed.
    pub(super) fn send_handshake(&mut self, to: ShortId) {
        let payload = self.identity.agreement_public().serialize().to_vec();
        let frame = self.frame(PacketType::Handshake, Some(to), payload);
        self.driver.broadcast(&frame, None);
        self.handshakes_sent.insert(to);
        debug!(peer = %to, "handshake sent");
    }

    /// Seal a typed body for a peer and send it, chunked when the
    /// ciphertext exceeds the inline cap.
    pub(super) fn send_envelope(
        &mut self,
        to: ShortId,
        kind: EnvelopeKind,
        body: &[u8],
    ) -> Result<(), NodeError> {
        let ciphertext = self.sessions.encrypt_for(&to, kind, body)?;

        if ciphertext.len() <= INLINE_CIPHERTEXT_MAX {
            let frame = self.frame(PacketType::Envelope, Some(to), ciphertext);
            self.driver.broadcast(&frame, None);
            return Ok(());
        }

        let transfer_id = new_message_id();
        let (meta, fragments) = chunker::split_ciphertext(&transfer_id, &ciphertext);
        debug!(
            peer = %to,
            transfer_id = %transfer_id,
            bytes = meta.total_size,
            chunks = meta.total_chunks,
            "envelope oversized, chunking"
        );

        let meta_frame = self.frame(PacketType::EnvelopeMetadata, Some(to), meta.encode());
        self.driver.broadcast(&meta_frame, None);

        let fragment_frames = fragments
            .into_iter()
            .map(|f| self.frame(PacketType::Fragment, Some(to), f.encode()))
            .collect();
        spawn_paced(
            fragment_frames,
            self.driver.clone(),
            self.shutdown_tx.subscribe(),
        );

        Ok(())
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::NotRunning)
        }
    }
}

/// Transmit frames with the inter-fragment pause, off the node loop.
/// Observes shutdown so a stopping node does not keep chattering.
fn spawn_paced(
    frames: Vec<Vec<u8>>,
    driver: Arc<dyn LinkDriver>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        for frame in frames {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(FRAGMENT_PACING_MS)) => {}
                _ = shutdown.changed() => return,
            }
            driver.broadcast(&frame, None);
        }
    });
}

/// Guess a mime type from the file extension. Unknown extensions travel
/// as octet streams.
fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique_hex() {
        let a = new_message_id();
        let b = new_message_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_mime_guess() {
        assert_eq!(mime_type_for(Path::new("a/report.TXT")), "text/plain");
        assert_eq!(mime_type_for(Path::new("img.png")), "image/png");
        assert_eq!(mime_type_for(Path::new("x.bin")), "application/octet-stream");
        assert_eq!(mime_type_for(Path::new("noext")), "application/octet-stream");
    }
}
