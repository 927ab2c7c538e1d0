//! Wire protocol: JSON envelopes and binary file frames sharing one TCP
//! stream.
//!
//! A JSON frame is `[4 B length BE][length bytes of UTF-8 JSON]`. A binary
//! frame is `[4 B length BE]['B' 'I' 'N'][1 B type][payload][4 B CRC32 BE]`,
//! where `length` covers everything after itself, including the trailing
//! CRC32. The CRC32 covers every byte following the length field up to but
//! excluding the CRC32 itself — magic, type, and payload. The reader
//! distinguishes the two by peeking the first byte after
//! the length prefix: `{` means JSON, `B` means binary. Any other byte is a
//! protocol violation.
//!
//! `tokio::net::TcpStream` has no convenient peek-without-consuming
//! primitive for this framing, so the reader consumes that first byte into a
//! small buffer and dispatches on it rather than using a socket-level peek.

use crate::types::{DeviceId, FileId, Platform};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest JSON frame we will encode or accept, in bytes of JSON payload
/// (excluding the 4-byte length prefix).
pub const MAX_JSON_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest binary frame we will encode or accept, in bytes following the
/// length prefix (magic + type + payload + CRC32).
pub const MAX_BINARY_FRAME_SIZE: usize = 11 * 1024 * 1024;

/// Largest file we will declare or accept in a `file_meta` frame.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Largest chunk payload we will encode or accept in a `file_chunk` frame.
pub const MAX_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// Largest filename we will encode or accept in a `file_meta` frame.
pub const MAX_FILENAME_LEN: usize = 1024;

const BINARY_MAGIC: [u8; 3] = *b"BIN";
const FRAME_TYPE_META: u8 = 0x01;
const FRAME_TYPE_CHUNK: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json encode/decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame too large: {got} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("unrecognized frame discriminator byte {0:#04x}")]
    UnknownDiscriminator(u8),

    #[error("invalid binary frame magic")]
    InvalidMagic,

    #[error("unrecognized binary frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("crc32 checksum mismatch")]
    ChecksumMismatch,

    #[error("file size {got} exceeds limit of {limit} bytes")]
    FileTooLarge { got: u64, limit: u64 },

    #[error("chunk size {got} exceeds limit of {limit} bytes")]
    ChunkTooLarge { got: u32, limit: u32 },

    #[error("filename length {got} exceeds limit of {limit} bytes")]
    FilenameTooLong { got: usize, limit: usize },

    #[error("compression flag {0} is not supported")]
    UnsupportedCompression(u8),
}

/// Known envelope `type` values. New types must be ignored, not treated as
/// fatal — callers match on these constants and fall through to a warning
/// log on anything else.
pub mod envelope_kind {
    pub const HANDSHAKE: &str = "handshake";
    pub const MESSAGE: &str = "message";
    pub const GROUP_MASTER: &str = "group_master";
    pub const GROUP_INVITE: &str = "group_invite";
    pub const GROUP_JOIN: &str = "group_join";
    pub const GROUP_JOIN_ACK: &str = "group_join_ack";
    pub const GROUP_JOIN_REJECT: &str = "group_join_reject";
    pub const GROUP_MESSAGE: &str = "group_message";
}

/// A JSON control message. Every envelope carries the sender's identity and
/// a `payload` object whose shape depends on `kind`. Payloads are kept as
/// `serde_json::Value` and decoded on demand via [`Envelope::payload_as`],
/// since the wire format does not tag `payload` itself — `kind` is the
/// discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        kind: impl Into<String>,
        device_id: DeviceId,
        device_name: impl Into<String>,
        platform: Platform,
        payload: impl Serialize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: kind.into(),
            device_id,
            device_name: device_name.into(),
            platform,
            timestamp: crate::types::Timestamp::now().as_secs(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserializes `payload` into a concrete type, e.g. `MessagePayload`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMasterPayload {
    pub group_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub master_id: String,
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInvitePayload {
    pub group_id: String,
    pub name: String,
    pub master_id: String,
    pub inviter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinPayload {
    pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinAckPayload {
    pub group_id: String,
    pub members: Vec<String>,
    pub master_id: String,
    pub epoch: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinRejectPayload {
    pub group_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessagePayload {
    pub group_id: String,
    pub message_id: String,
    pub from_id: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Binary file frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaFrame {
    pub file_id: FileId,
    pub size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkFrame {
    pub file_id: FileId,
    pub chunk_index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    Meta(FileMetaFrame),
    Chunk(FileChunkFrame),
}

impl FileMetaFrame {
    pub fn new(file_id: FileId, size: u64, filename: String) -> Result<Self, ProtocolError> {
        if size > MAX_FILE_SIZE {
            return Err(ProtocolError::FileTooLarge {
                got: size,
                limit: MAX_FILE_SIZE,
            });
        }
        if filename.len() > MAX_FILENAME_LEN {
            return Err(ProtocolError::FilenameTooLong {
                got: filename.len(),
                limit: MAX_FILENAME_LEN,
            });
        }
        Ok(Self {
            file_id,
            size,
            filename,
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let filename_bytes = self.filename.as_bytes();
        let mut out = Vec::with_capacity(1 + 16 + 8 + 1 + 2 + filename_bytes.len());
        out.push(FRAME_TYPE_META);
        out.extend_from_slice(self.file_id.as_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out.push(0u8); // compression flag, reserved
        out.extend_from_slice(&(filename_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(filename_bytes);
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 16 + 8 + 1 + 2 {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file_meta body truncated",
            )));
        }
        let mut file_id_bytes = [0u8; 16];
        file_id_bytes.copy_from_slice(&body[0..16]);
        let size = u64::from_be_bytes(body[16..24].try_into().unwrap());
        let compression = body[24];
        if compression != 0 {
            return Err(ProtocolError::UnsupportedCompression(compression));
        }
        let filename_len = u16::from_be_bytes(body[25..27].try_into().unwrap()) as usize;
        if body.len() != 27 + filename_len {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file_meta filename truncated",
            )));
        }
        let filename = String::from_utf8(body[27..27 + filename_len].to_vec()).map_err(|_| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "file_meta filename is not valid utf-8",
            ))
        })?;
        FileMetaFrame::new(FileId::from_bytes(file_id_bytes), size, filename)
    }
}

impl FileChunkFrame {
    pub fn new(file_id: FileId, chunk_index: u32, data: Vec<u8>) -> Result<Self, ProtocolError> {
        if data.len() as u64 > MAX_CHUNK_SIZE as u64 {
            return Err(ProtocolError::ChunkTooLarge {
                got: data.len() as u32,
                limit: MAX_CHUNK_SIZE,
            });
        }
        Ok(Self {
            file_id,
            chunk_index,
            data,
        })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 16 + 4 + 4 + self.data.len());
        out.push(FRAME_TYPE_CHUNK);
        out.extend_from_slice(self.file_id.as_bytes());
        out.extend_from_slice(&self.chunk_index.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 16 + 4 + 4 {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file_chunk header truncated",
            )));
        }
        let mut file_id_bytes = [0u8; 16];
        file_id_bytes.copy_from_slice(&body[0..16]);
        let chunk_index = u32::from_be_bytes(body[16..20].try_into().unwrap());
        let chunk_size = u32::from_be_bytes(body[20..24].try_into().unwrap());
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ChunkTooLarge {
                got: chunk_size,
                limit: MAX_CHUNK_SIZE,
            });
        }
        if body.len() != 24 + chunk_size as usize {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file_chunk payload truncated",
            )));
        }
        let data = body[24..24 + chunk_size as usize].to_vec();
        FileChunkFrame::new(FileId::from_bytes(file_id_bytes), chunk_index, data)
    }
}

impl BinaryFrame {
    fn encode_body(&self) -> Vec<u8> {
        match self {
            BinaryFrame::Meta(m) => m.encode_body(),
            BinaryFrame::Chunk(c) => c.encode_body(),
        }
    }
}

/// One parsed frame off the wire: either a JSON control envelope or a binary
/// file frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Json(Envelope),
    Binary(BinaryFrame),
}

// ---------------------------------------------------------------------------
// Encoding (pure, byte-buffer level — used directly by the unit tests below
// and internally by the async write functions)
// ---------------------------------------------------------------------------

pub fn encode_json_frame(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_JSON_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            got: body.len(),
            limit: MAX_JSON_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encode_binary_frame(frame: &BinaryFrame) -> Result<Vec<u8>, ProtocolError> {
    let body = frame.encode_body();
    let mut checked = Vec::with_capacity(BINARY_MAGIC.len() + body.len());
    checked.extend_from_slice(&BINARY_MAGIC);
    checked.extend_from_slice(&body);
    let crc = crc32fast::hash(&checked);
    let total_len = body.len() + 4;
    if total_len + 3 > MAX_BINARY_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            got: total_len + 3,
            limit: MAX_BINARY_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(4 + 3 + total_len);
    out.extend_from_slice(&(total_len as u32 + 3).to_be_bytes());
    out.extend_from_slice(&BINARY_MAGIC);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

fn decode_binary_body(first: u8, rest: &[u8]) -> Result<BinaryFrame, ProtocolError> {
    if rest.len() < 2 + 1 + 4 {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "binary frame truncated",
        )));
    }
    if first != BINARY_MAGIC[0] || rest[0] != BINARY_MAGIC[1] || rest[1] != BINARY_MAGIC[2] {
        return Err(ProtocolError::InvalidMagic);
    }
    let crc_offset = rest.len() - 4;
    let expected_crc = u32::from_be_bytes(rest[crc_offset..].try_into().unwrap());

    let mut checked = Vec::with_capacity(1 + crc_offset);
    checked.push(first);
    checked.extend_from_slice(&rest[..crc_offset]);
    let actual_crc = crc32fast::hash(&checked);
    if actual_crc != expected_crc {
        return Err(ProtocolError::ChecksumMismatch);
    }

    let type_byte = rest[2];
    let body = &rest[3..crc_offset];
    match type_byte {
        FRAME_TYPE_META => Ok(BinaryFrame::Meta(FileMetaFrame::decode_body(body)?)),
        FRAME_TYPE_CHUNK => Ok(BinaryFrame::Chunk(FileChunkFrame::decode_body(body)?)),
        other => Err(ProtocolError::UnknownFrameType(other)),
    }
}

// ---------------------------------------------------------------------------
// Async I/O
// ---------------------------------------------------------------------------

pub async fn write_json_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let bytes = encode_json_frame(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_binary_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &BinaryFrame,
) -> Result<(), ProtocolError> {
    let bytes = encode_binary_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one frame off `reader`, dispatching on the first byte after
/// the length prefix. Returns `ProtocolError::ConnectionClosed` on a clean
/// EOF before any bytes of a new frame arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_be_bytes(len_buf) as usize;
    if length == 0 {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "zero-length frame",
        )));
    }

    let mut first = [0u8; 1];
    reader.read_exact(&mut first).await?;
    let first = first[0];

    match first {
        b'{' => {
            if length > MAX_JSON_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    got: length,
                    limit: MAX_JSON_FRAME_SIZE,
                });
            }
            let mut rest = vec![0u8; length - 1];
            reader.read_exact(&mut rest).await?;
            let mut full = Vec::with_capacity(length);
            full.push(first);
            full.extend_from_slice(&rest);
            let envelope: Envelope = serde_json::from_slice(&full)?;
            Ok(Frame::Json(envelope))
        }
        b'B' => {
            if length > MAX_BINARY_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    got: length,
                    limit: MAX_BINARY_FRAME_SIZE,
                });
            }
            let mut rest = vec![0u8; length - 1];
            reader.read_exact(&mut rest).await?;
            Ok(Frame::Binary(decode_binary_body(first, &rest)?))
        }
        other => Err(ProtocolError::UnknownDiscriminator(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, Platform};

    fn test_envelope(kind: &str) -> Envelope {
        Envelope::new(
            kind,
            DeviceId::new("device-a"),
            "device-a-name",
            Platform::Pc,
            serde_json::json!({ "text": "hola" }),
        )
        .unwrap()
    }

    #[test]
    fn json_frame_roundtrip() {
        let envelope = test_envelope(envelope_kind::MESSAGE);
        let bytes = encode_json_frame(&envelope).unwrap();
        let length = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(length, bytes.len() - 4);
        let parsed: Envelope = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(parsed.kind, envelope.kind);
        assert_eq!(parsed.device_id, envelope.device_id);
    }

    #[test]
    fn binary_meta_frame_roundtrip() {
        let file_id = FileId::generate();
        let meta = FileMetaFrame::new(file_id, 42, "notes.txt".to_string()).unwrap();
        let bytes = encode_binary_frame(&BinaryFrame::Meta(meta.clone())).unwrap();
        let length = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let decoded = decode_binary_body(bytes[4], &bytes[5..4 + length]).unwrap();
        match decoded {
            BinaryFrame::Meta(m) => assert_eq!(m, meta),
            _ => panic!("expected meta frame"),
        }
    }

    #[test]
    fn binary_chunk_frame_roundtrip() {
        let file_id = FileId::generate();
        let chunk = FileChunkFrame::new(file_id, 3, vec![1, 2, 3, 4, 5]).unwrap();
        let bytes = encode_binary_frame(&BinaryFrame::Chunk(chunk.clone())).unwrap();
        let length = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let decoded = decode_binary_body(bytes[4], &bytes[5..4 + length]).unwrap();
        match decoded {
            BinaryFrame::Chunk(c) => assert_eq!(c, chunk),
            _ => panic!("expected chunk frame"),
        }
    }

    #[test]
    fn corrupted_chunk_fails_checksum() {
        let file_id = FileId::generate();
        let chunk = FileChunkFrame::new(file_id, 0, vec![9, 9, 9]).unwrap();
        let mut bytes = encode_binary_frame(&BinaryFrame::Chunk(chunk)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let length = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let err = decode_binary_body(bytes[4], &bytes[5..4 + length]).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch));
    }

    #[test]
    fn file_size_over_limit_rejected() {
        let err =
            FileMetaFrame::new(FileId::generate(), MAX_FILE_SIZE + 1, "x".into()).unwrap_err();
        assert!(matches!(err, ProtocolError::FileTooLarge { .. }));
    }

    #[test]
    fn file_size_at_limit_accepted() {
        assert!(FileMetaFrame::new(FileId::generate(), MAX_FILE_SIZE, "x".into()).is_ok());
    }

    #[test]
    fn chunk_over_limit_rejected() {
        let data = vec![0u8; MAX_CHUNK_SIZE as usize + 1];
        let err = FileChunkFrame::new(FileId::generate(), 0, data).unwrap_err();
        assert!(matches!(err, ProtocolError::ChunkTooLarge { .. }));
    }

    #[test]
    fn filename_over_limit_rejected() {
        let name = "a".repeat(MAX_FILENAME_LEN + 1);
        let err = FileMetaFrame::new(FileId::generate(), 0, name).unwrap_err();
        assert!(matches!(err, ProtocolError::FilenameTooLong { .. }));
    }

    #[tokio::test]
    async fn async_json_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let envelope = test_envelope(envelope_kind::HANDSHAKE);
        write_json_frame(&mut client, &envelope).await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        match frame {
            Frame::Json(got) => assert_eq!(got.kind, envelope.kind),
            _ => panic!("expected json frame"),
        }
    }

    #[tokio::test]
    async fn async_binary_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(65536);
        let chunk = FileChunkFrame::new(FileId::generate(), 1, vec![1, 2, 3]).unwrap();
        write_binary_frame(&mut client, &BinaryFrame::Chunk(chunk.clone()))
            .await
            .unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        match frame {
            Frame::Binary(BinaryFrame::Chunk(c)) => assert_eq!(c, chunk),
            _ => panic!("expected binary chunk frame"),
        }
    }

    #[tokio::test]
    async fn async_interleaved_json_and_binary_frames() {
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let file_id = FileId::generate();
        let chunk0 = FileChunkFrame::new(file_id, 0, vec![0xAA; 16]).unwrap();
        let note = test_envelope(envelope_kind::MESSAGE);
        let chunk1 = FileChunkFrame::new(file_id, 1, vec![0xBB; 16]).unwrap();

        write_binary_frame(&mut client, &BinaryFrame::Chunk(chunk0.clone()))
            .await
            .unwrap();
        write_json_frame(&mut client, &note).await.unwrap();
        write_binary_frame(&mut client, &BinaryFrame::Chunk(chunk1.clone()))
            .await
            .unwrap();

        match read_frame(&mut server).await.unwrap() {
            Frame::Binary(BinaryFrame::Chunk(c)) => assert_eq!(c, chunk0),
            _ => panic!("expected chunk 0"),
        }
        match read_frame(&mut server).await.unwrap() {
            Frame::Json(e) => assert_eq!(e.kind, note.kind),
            _ => panic!("expected json note"),
        }
        match read_frame(&mut server).await.unwrap() {
            Frame::Binary(BinaryFrame::Chunk(c)) => assert_eq!(c, chunk1),
            _ => panic!("expected chunk 1"),
        }
    }

    #[tokio::test]
    async fn read_frame_on_clean_eof_reports_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}
