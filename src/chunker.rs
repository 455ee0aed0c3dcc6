//! Chunked Transfers
//!
//! Payloads larger than a radio frame travel as a metadata packet
//! followed by numbered fragments, shared between two users:
//!
//!   - files: 180-byte fragments announced by `FileMetadata`
//!   - oversized envelope ciphertexts: 400-byte fragments announced by
//!     `TransferMetadata`, reassembled and then decrypted as if the whole
//!     buffer had arrived in a single envelope
//!
//! There is no retransmission or negative acknowledgement. Fragments for
//! an unannounced transfer are dropped, and transfers that stall are
//! expired by a periodic sweep so a lost fragment cannot pin memory
//! forever.

use crate::identity::ShortId;
use crate::tlv::{FileMetadata, Fragment, TransferMetadata};
use std::collections::HashMap;
use thiserror::Error;

/// Fragment body size for file transfers.
pub const FILE_FRAGMENT_SIZE: usize = 180;

/// Fragment body size for chunked envelope ciphertexts.
pub const CIPHER_FRAGMENT_SIZE: usize = 400;

/// Largest envelope ciphertext sent whole; anything bigger is chunked.
pub const INLINE_CIPHERTEXT_MAX: usize = 450;

/// Pause between successive fragment transmissions, for slow radios.
pub const FRAGMENT_PACING_MS: u64 = 50;

/// Default lifetime of an incomplete transfer.
pub const DEFAULT_TRANSFER_EXPIRY_MS: u64 = 60_000;

/// Default cap on concurrently reassembling transfers.
pub const DEFAULT_MAX_INFLIGHT: usize = 32;

/// Errors from transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file too large for a chunked transfer: {0} bytes")]
    FileTooLarge(u64),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
}

// ============================================================================
// Send Side
// ============================================================================

/// Split file contents into a metadata record plus fragments.
pub fn split_file(
    transfer_id: &str,
    file_name: &str,
    mime_type: &str,
    data: &[u8],
) -> Result<(FileMetadata, Vec<Fragment>), TransferError> {
    if data.len() > u32::MAX as usize {
        return Err(TransferError::FileTooLarge(data.len() as u64));
    }

    let fragments = split(transfer_id, data, FILE_FRAGMENT_SIZE);
    let metadata = FileMetadata {
        transfer_id: transfer_id.to_string(),
        file_name: file_name.to_string(),
        file_size: data.len() as u32,
        mime_type: mime_type.to_string(),
        total_chunks: fragments.len() as u32,
    };
    Ok((metadata, fragments))
}

/// Split an oversized envelope ciphertext into a metadata record plus
/// fragments.
pub fn split_ciphertext(transfer_id: &str, data: &[u8]) -> (TransferMetadata, Vec<Fragment>) {
    let fragments = split(transfer_id, data, CIPHER_FRAGMENT_SIZE);
    let metadata = TransferMetadata {
        transfer_id: transfer_id.to_string(),
        total_size: data.len() as u32,
        total_chunks: fragments.len() as u32,
    };
    (metadata, fragments)
}

fn split(transfer_id: &str, data: &[u8], fragment_size: usize) -> Vec<Fragment> {
    let total_chunks = data.len().div_ceil(fragment_size) as u32;

    data.chunks(fragment_size)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            transfer_id: transfer_id.to_string(),
            chunk_index: i as u32,
            total_chunks,
            data: chunk.to_vec(),
        })
        .collect()
}

// ============================================================================
// Receive Side
// ============================================================================

/// A transfer mid-reassembly.
#[derive(Debug)]
enum PendingTransfer {
    File {
        sender: ShortId,
        file_name: String,
        file_size: u32,
        mime_type: String,
        total_chunks: u32,
        chunks: HashMap<u32, Vec<u8>>,
        created_ms: u64,
    },
    Envelope {
        sender: ShortId,
        total_chunks: u32,
        chunks: HashMap<u32, Vec<u8>>,
        created_ms: u64,
    },
}

impl PendingTransfer {
    fn created_ms(&self) -> u64 {
        match self {
            PendingTransfer::File { created_ms, .. } => *created_ms,
            PendingTransfer::Envelope { created_ms, .. } => *created_ms,
        }
    }
}

/// A fully reassembled transfer, ready for delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum CompletedTransfer {
    /// A file; `data` is the original byte sequence.
    File {
        sender: ShortId,
        file_name: String,
        file_size: u32,
        mime_type: String,
        data: Vec<u8>,
    },
    /// An envelope ciphertext to decrypt as if it had arrived whole from
    /// `sender`.
    Envelope { sender: ShortId, data: Vec<u8> },
}

/// Reassembly state for all in-flight transfers, keyed by transfer id.
///
/// Owned exclusively by the node task.
#[derive(Debug)]
pub struct ReassemblyTable {
    transfers: HashMap<String, PendingTransfer>,
    expiry_ms: u64,
    max_inflight: usize,
}

impl ReassemblyTable {
    /// Create a table with the given expiry and in-flight cap.
    pub fn new(expiry_ms: u64, max_inflight: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            expiry_ms,
            max_inflight: max_inflight.max(1),
        }
    }

    /// Create a table with the default limits.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TRANSFER_EXPIRY_MS, DEFAULT_MAX_INFLIGHT)
    }

    /// Number of transfers mid-reassembly.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Register an announced file transfer.
    pub fn begin_file(&mut self, meta: FileMetadata, sender: ShortId, now_ms: u64) {
        self.make_room();
        self.transfers.insert(
            meta.transfer_id,
            PendingTransfer::File {
                sender,
                file_name: meta.file_name,
                file_size: meta.file_size,
                mime_type: meta.mime_type,
                total_chunks: meta.total_chunks,
                chunks: HashMap::new(),
                created_ms: now_ms,
            },
        );
    }

    /// Register an announced chunked envelope.
    pub fn begin_envelope(&mut self, meta: TransferMetadata, sender: ShortId, now_ms: u64) {
        self.make_room();
        self.transfers.insert(
            meta.transfer_id,
            PendingTransfer::Envelope {
                sender,
                total_chunks: meta.total_chunks,
                chunks: HashMap::new(),
                created_ms: now_ms,
            },
        );
    }

    /// Whether a transfer id is known.
    pub fn knows(&self, transfer_id: &str) -> bool {
        self.transfers.contains_key(transfer_id)
    }

    /// Store a fragment. Returns the completed transfer once every chunk
    /// has arrived; fragments for unknown ids return None and the caller
    /// drops them.
    pub fn insert_fragment(&mut self, fragment: Fragment) -> Option<CompletedTransfer> {
        let pending = self.transfers.get_mut(&fragment.transfer_id)?;

        let (chunks, total) = match pending {
            PendingTransfer::File {
                chunks,
                total_chunks,
                ..
            } => (chunks, *total_chunks),
            PendingTransfer::Envelope {
                chunks,
                total_chunks,
                ..
            } => (chunks, *total_chunks),
        };

        if fragment.chunk_index >= total {
            return None;
        }
        chunks.insert(fragment.chunk_index, fragment.data);

        if chunks.len() as u32 != total {
            return None;
        }

        // Complete: remove and concatenate in ascending index order.
        let pending = self.transfers.remove(&fragment.transfer_id)?;
        match pending {
            PendingTransfer::File {
                sender,
                file_name,
                file_size,
                mime_type,
                total_chunks,
                mut chunks,
                ..
            } => Some(CompletedTransfer::File {
                sender,
                file_name,
                file_size,
                mime_type,
                data: concat_chunks(&mut chunks, total_chunks),
            }),
            PendingTransfer::Envelope {
                sender,
                total_chunks,
                mut chunks,
                ..
            } => Some(CompletedTransfer::Envelope {
                sender,
                data: concat_chunks(&mut chunks, total_chunks),
            }),
        }
    }

    /// Drop transfers older than the expiry. Returns how many were
    /// removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let expiry = self.expiry_ms;
        let before = self.transfers.len();
        self.transfers
            .retain(|_, t| now_ms.saturating_sub(t.created_ms()) < expiry);
        before - self.transfers.len()
    }

    /// Forget everything (node shutdown).
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    /// Evict the oldest transfer when at the in-flight cap.
    fn make_room(&mut self) {
        while self.transfers.len() >= self.max_inflight {
            let oldest = self
                .transfers
                .iter()
                .min_by_key(|(_, t)| t.created_ms())
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.transfers.remove(&id);
                }
                None => break,
            }
        }
    }
}

fn concat_chunks(chunks: &mut HashMap<u32, Vec<u8>>, total: u32) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..total {
        if let Some(chunk) = chunks.remove(&i) {
            data.extend_from_slice(&chunk);
        }
    }
    data
}
