//! TLV Payload Encoding
//!
//! Packet payloads that carry structured data use tag/length/value
//! records: `[tag:1][length:2 BE][value:length]`. Tags are local to each
//! payload shape; decoders skip unknown tags so payloads can grow without
//! breaking old nodes. Fixed-width integer values are big-endian.
//!
//! This module provides the raw reader/writer plus one struct per payload
//! shape, each with `encode`/`decode`.

use std::fmt;
use thiserror::Error;

/// Errors that can arise when decoding TLV payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("truncated record: tag 0x{tag:02x} declares {declared} bytes, {remaining} remain")]
    Truncated {
        tag: u8,
        declared: usize,
        remaining: usize,
    },

    #[error("dangling bytes at end of payload: {0}")]
    Dangling(usize),

    #[error("value for tag 0x{tag:02x} is not valid UTF-8")]
    BadUtf8 { tag: u8 },

    #[error("value for tag 0x{tag:02x} has wrong width: expected {expected}, got {got}")]
    BadWidth { tag: u8, expected: usize, got: usize },

    #[error("missing required tag 0x{0:02x}")]
    MissingTag(u8),

    #[error("value too long for a TLV record: {0} > 65535")]
    ValueTooLong(usize),
}

// ============================================================================
// Writer
// ============================================================================

/// Incremental TLV payload builder.
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw byte value.
    pub fn bytes(mut self, tag: u8, value: &[u8]) -> Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.buf.push(tag);
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a UTF-8 string value.
    pub fn string(self, tag: u8, value: &str) -> Self {
        self.bytes(tag, value.as_bytes())
    }

    /// Append a big-endian u32 value.
    pub fn u32(self, tag: u8, value: u32) -> Self {
        self.bytes(tag, &value.to_be_bytes())
    }

    /// Finish and return the payload bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ============================================================================
// Reader
// ============================================================================

/// One decoded TLV record borrowing from the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

impl<'a> TlvRecord<'a> {
    /// Interpret the value as UTF-8.
    pub fn as_str(&self) -> Result<&'a str, TlvError> {
        std::str::from_utf8(self.value).map_err(|_| TlvError::BadUtf8 { tag: self.tag })
    }

    /// Interpret the value as a big-endian u32.
    pub fn as_u32(&self) -> Result<u32, TlvError> {
        let bytes: [u8; 4] = self.value.try_into().map_err(|_| TlvError::BadWidth {
            tag: self.tag,
            expected: 4,
            got: self.value.len(),
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Iterator over the records of a TLV payload.
///
/// Yields every well-formed record in order; callers match on tags and
/// skip the ones they do not know. A record whose declared length runs
/// past the end of the payload is an error.
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    /// Create a reader over a payload.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<TlvRecord<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len() - self.pos;
        if remaining == 0 {
            return None;
        }
        if remaining < 3 {
            self.pos = self.data.len();
            return Some(Err(TlvError::Dangling(remaining)));
        }

        let tag = self.data[self.pos];
        let len = u16::from_be_bytes([self.data[self.pos + 1], self.data[self.pos + 2]]) as usize;
        let start = self.pos + 3;

        if start + len > self.data.len() {
            self.pos = self.data.len();
            return Some(Err(TlvError::Truncated {
                tag,
                declared: len,
                remaining: self.data.len() - start,
            }));
        }

        self.pos = start + len;
        Some(Ok(TlvRecord {
            tag,
            value: &self.data[start..start + len],
        }))
    }
}

// ============================================================================
// Inner Envelope Payload Types
// ============================================================================

/// Type byte leading the plaintext inside an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Encrypted one-to-one chat message.
    PrivateMessage = 0x01,
    /// The recipient has read a message.
    ReadReceipt = 0x02,
    /// The recipient's node has received a message.
    DeliveryAck = 0x03,
    /// Reserved: end-to-end encrypted file transfer.
    FileTransfer = 0x04,
    /// Reserved: peer verification challenge.
    VerifyChallenge = 0x05,
    /// Reserved: peer verification response.
    VerifyResponse = 0x06,
    /// Application-defined message, body opaque to the mesh.
    AppMessage = 0x07,
    /// Response to an application-defined message.
    AppResponse = 0x08,
}

impl EnvelopeKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(EnvelopeKind::PrivateMessage),
            0x02 => Some(EnvelopeKind::ReadReceipt),
            0x03 => Some(EnvelopeKind::DeliveryAck),
            0x04 => Some(EnvelopeKind::FileTransfer),
            0x05 => Some(EnvelopeKind::VerifyChallenge),
            0x06 => Some(EnvelopeKind::VerifyResponse),
            0x07 => Some(EnvelopeKind::AppMessage),
            0x08 => Some(EnvelopeKind::AppResponse),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::PrivateMessage => "PrivateMessage",
            EnvelopeKind::ReadReceipt => "ReadReceipt",
            EnvelopeKind::DeliveryAck => "DeliveryAck",
            EnvelopeKind::FileTransfer => "FileTransfer",
            EnvelopeKind::VerifyChallenge => "VerifyChallenge",
            EnvelopeKind::VerifyResponse => "VerifyResponse",
            EnvelopeKind::AppMessage => "AppMessage",
            EnvelopeKind::AppResponse => "AppResponse",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Payload Shapes
// ============================================================================

/// Announce payload: nickname plus the two public keys.
///
/// Tags: 0x01 nickname (utf8), 0x02 key-agreement public key (raw),
/// 0x03 signing public key (raw).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announce {
    pub nickname: String,
    pub agreement_key: Vec<u8>,
    pub signing_key: Vec<u8>,
}

impl Announce {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.nickname)
            .bytes(0x02, &self.agreement_key)
            .bytes(0x03, &self.signing_key)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut nickname = None;
        let mut agreement_key = None;
        let mut signing_key = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => nickname = Some(record.as_str()?.to_string()),
                0x02 => agreement_key = Some(record.value.to_vec()),
                0x03 => signing_key = Some(record.value.to_vec()),
                _ => {} // unknown tag, skip
            }
        }

        Ok(Self {
            nickname: nickname.ok_or(TlvError::MissingTag(0x01))?,
            agreement_key: agreement_key.ok_or(TlvError::MissingTag(0x02))?,
            signing_key: signing_key.ok_or(TlvError::MissingTag(0x03))?,
        })
    }
}

/// Private message body inside an envelope.
///
/// Tags: 0x01 message id (utf8), 0x02 content (utf8).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: String,
    pub content: String,
}

impl PrivateMessage {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.id)
            .string(0x02, &self.content)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut id = None;
        let mut content = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => id = Some(record.as_str()?.to_string()),
                0x02 => content = Some(record.as_str()?.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            id: id.ok_or(TlvError::MissingTag(0x01))?,
            content: content.ok_or(TlvError::MissingTag(0x02))?,
        })
    }
}

/// File transfer announcement.
///
/// Tags: 0x01 transfer id (utf8), 0x02 file name (utf8), 0x03 file size
/// (u32), 0x04 mime type (utf8), 0x05 total chunks (u32).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u32,
    pub mime_type: String,
    pub total_chunks: u32,
}

impl FileMetadata {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.transfer_id)
            .string(0x02, &self.file_name)
            .u32(0x03, self.file_size)
            .string(0x04, &self.mime_type)
            .u32(0x05, self.total_chunks)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut transfer_id = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut mime_type = None;
        let mut total_chunks = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => transfer_id = Some(record.as_str()?.to_string()),
                0x02 => file_name = Some(record.as_str()?.to_string()),
                0x03 => file_size = Some(record.as_u32()?),
                0x04 => mime_type = Some(record.as_str()?.to_string()),
                0x05 => total_chunks = Some(record.as_u32()?),
                _ => {}
            }
        }

        Ok(Self {
            transfer_id: transfer_id.ok_or(TlvError::MissingTag(0x01))?,
            file_name: file_name.ok_or(TlvError::MissingTag(0x02))?,
            file_size: file_size.ok_or(TlvError::MissingTag(0x03))?,
            mime_type: mime_type.ok_or(TlvError::MissingTag(0x04))?,
            total_chunks: total_chunks.ok_or(TlvError::MissingTag(0x05))?,
        })
    }
}

/// One chunk of a larger transfer.
///
/// Tags: 0x01 transfer id (utf8), 0x02 chunk index (u32), 0x03 total
/// chunks (u32), 0x04 chunk data (bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.transfer_id)
            .u32(0x02, self.chunk_index)
            .u32(0x03, self.total_chunks)
            .bytes(0x04, &self.data)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut transfer_id = None;
        let mut chunk_index = None;
        let mut total_chunks = None;
        let mut chunk_data = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => transfer_id = Some(record.as_str()?.to_string()),
                0x02 => chunk_index = Some(record.as_u32()?),
                0x03 => total_chunks = Some(record.as_u32()?),
                0x04 => chunk_data = Some(record.value.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            transfer_id: transfer_id.ok_or(TlvError::MissingTag(0x01))?,
            chunk_index: chunk_index.ok_or(TlvError::MissingTag(0x02))?,
            total_chunks: total_chunks.ok_or(TlvError::MissingTag(0x03))?,
            data: chunk_data.ok_or(TlvError::MissingTag(0x04))?,
        })
    }
}

/// Chunked oversized-envelope announcement.
///
/// Tags: 0x01 transfer id (utf8), 0x02 total size (u32), 0x03 total
/// chunks (u32).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferMetadata {
    pub transfer_id: String,
    pub total_size: u32,
    pub total_chunks: u32,
}

impl TransferMetadata {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.transfer_id)
            .u32(0x02, self.total_size)
            .u32(0x03, self.total_chunks)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut transfer_id = None;
        let mut total_size = None;
        let mut total_chunks = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => transfer_id = Some(record.as_str()?.to_string()),
                0x02 => total_size = Some(record.as_u32()?),
                0x03 => total_chunks = Some(record.as_u32()?),
                _ => {}
            }
        }

        Ok(Self {
            transfer_id: transfer_id.ok_or(TlvError::MissingTag(0x01))?,
            total_size: total_size.ok_or(TlvError::MissingTag(0x02))?,
            total_chunks: total_chunks.ok_or(TlvError::MissingTag(0x03))?,
        })
    }
}

/// Application message body inside an envelope. The body bytes are opaque
/// to the mesh.
///
/// Tags: 0x01 id (utf8), 0x02 kind (utf8), 0x03 body (bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppMessage {
    pub id: String,
    pub kind: String,
    pub body: Vec<u8>,
}

impl AppMessage {
    pub fn encode(&self) -> Vec<u8> {
        TlvWriter::new()
            .string(0x01, &self.id)
            .string(0x02, &self.kind)
            .bytes(0x03, &self.body)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut id = None;
        let mut kind = None;
        let mut body = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => id = Some(record.as_str()?.to_string()),
                0x02 => kind = Some(record.as_str()?.to_string()),
                0x03 => body = Some(record.value.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            id: id.ok_or(TlvError::MissingTag(0x01))?,
            kind: kind.ok_or(TlvError::MissingTag(0x02))?,
            body: body.ok_or(TlvError::MissingTag(0x03))?,
        })
    }
}

/// Response to an application message. Success is the absence of an error
/// string.
///
/// Tags: 0x01 id (utf8), 0x02 payload (bytes, optional), 0x03 error
/// (utf8, optional).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppResponse {
    pub id: String,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl AppResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TlvWriter::new().string(0x01, &self.id);
        if let Some(payload) = &self.payload {
            writer = writer.bytes(0x02, payload);
        }
        if let Some(error) = &self.error {
            writer = writer.string(0x03, error);
        }
        writer.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut id = None;
        let mut payload = None;
        let mut error = None;

        for record in TlvReader::new(data) {
            let record = record?;
            match record.tag {
                0x01 => id = Some(record.as_str()?.to_string()),
                0x02 => payload = Some(record.value.to_vec()),
                0x03 => error = Some(record.as_str()?.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            id: id.ok_or(TlvError::MissingTag(0x01))?,
            payload,
            error,
        })
    }

    /// Whether this response reports success.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_yields_records_in_order() {
        let payload = TlvWriter::new()
            .string(0x01, "alpha")
            .u32(0x02, 1234)
            .bytes(0x03, &[0xff, 0xee])
            .finish();

        let records: Vec<_> = TlvReader::new(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].tag, 0x01);
        assert_eq!(records[0].as_str().unwrap(), "alpha");
        assert_eq!(records[1].as_u32().unwrap(), 1234);
        assert_eq!(records[2].value, &[0xff, 0xee]);
    }

    #[test]
    fn test_unknown_tags_are_skipped_by_decoders() {
        let payload = TlvWriter::new()
            .string(0x01, "m-1")
            .bytes(0x7f, b"future field")
            .string(0x02, "hello")
            .finish();

        let msg = PrivateMessage::decode(&payload).unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn test_truncated_record() {
        let mut payload = TlvWriter::new().string(0x01, "abcdef").finish();
        payload.truncate(payload.len() - 2);

        let result: Result<Vec<_>, _> = TlvReader::new(&payload).collect();
        assert!(matches!(result, Err(TlvError::Truncated { tag: 0x01, .. })));
    }

    #[test]
    fn test_dangling_bytes() {
        let result: Result<Vec<_>, _> = TlvReader::new(&[0x01, 0x00]).collect();
        assert_eq!(result, Err(TlvError::Dangling(2)));
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        assert_eq!(TlvReader::new(&[]).count(), 0);
    }

    #[test]
    fn test_u32_wrong_width() {
        let payload = TlvWriter::new().bytes(0x03, &[1, 2]).finish();
        let record = TlvReader::new(&payload).next().unwrap().unwrap();
        assert!(matches!(
            record.as_u32(),
            Err(TlvError::BadWidth { expected: 4, got: 2, .. })
        ));
    }

    #[test]
    fn test_announce_roundtrip() {
        let announce = Announce {
            nickname: "alice".into(),
            agreement_key: vec![2; 33],
            signing_key: vec![3; 32],
        };
        assert_eq!(Announce::decode(&announce.encode()).unwrap(), announce);
    }

    #[test]
    fn test_announce_missing_key() {
        let payload = TlvWriter::new().string(0x01, "alice").finish();
        assert_eq!(
            Announce::decode(&payload).unwrap_err(),
            TlvError::MissingTag(0x02)
        );
    }

    #[test]
    fn test_file_metadata_roundtrip() {
        let meta = FileMetadata {
            transfer_id: "t-42".into(),
            file_name: "x.bin".into(),
            file_size: 900,
            mime_type: "application/octet-stream".into(),
            total_chunks: 5,
        };
        assert_eq!(FileMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn test_fragment_roundtrip() {
        let fragment = Fragment {
            transfer_id: "t-42".into(),
            chunk_index: 3,
            total_chunks: 5,
            data: vec![0xaa; 180],
        };
        assert_eq!(Fragment::decode(&fragment.encode()).unwrap(), fragment);
    }

    #[test]
    fn test_transfer_metadata_roundtrip() {
        let meta = TransferMetadata {
            transfer_id: "tx-7".into(),
            total_size: 1516,
            total_chunks: 4,
        };
        assert_eq!(TransferMetadata::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn test_app_message_roundtrip() {
        let msg = AppMessage {
            id: "req-1".into(),
            kind: "tx".into(),
            body: vec![9; 1500],
        };
        assert_eq!(AppMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_app_response_roundtrip_success_and_error() {
        let ok = AppResponse {
            id: "req-1".into(),
            payload: Some(vec![1, 2, 3]),
            error: None,
        };
        let decoded = AppResponse::decode(&ok.encode()).unwrap();
        assert_eq!(decoded, ok);
        assert!(decoded.is_success());

        let err = AppResponse {
            id: "req-2".into(),
            payload: None,
            error: Some("rejected".into()),
        };
        let decoded = AppResponse::decode(&err.encode()).unwrap();
        assert_eq!(decoded, err);
        assert!(!decoded.is_success());
    }

    #[test]
    fn test_envelope_kind_bytes() {
        for byte in 0x01..=0x08u8 {
            assert_eq!(EnvelopeKind::from_byte(byte).unwrap().to_byte(), byte);
        }
        assert!(EnvelopeKind::from_byte(0x00).is_none());
        assert!(EnvelopeKind::from_byte(0x09).is_none());
    }

    #[test]
    fn test_bad_utf8_in_string_field() {
        let payload = TlvWriter::new()
            .bytes(0x01, &[0xff, 0xfe])
            .string(0x02, "ok")
            .finish();
        assert_eq!(
            PrivateMessage::decode(&payload).unwrap_err(),
            TlvError::BadUtf8 { tag: 0x01 }
        );
    }
}
