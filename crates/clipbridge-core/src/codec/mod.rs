//! Wire protocol: framing, the message type vocabulary, and AEAD envelope.
//!
//! ## Frame format
//!
//! ```text
//! <4-byte big-endian length N><N bytes payload>
//! ```
//!
//! `N` is the length of everything after the length prefix. The payload's
//! first byte disambiguates cleartext from encrypted: `0x01` means AEAD
//! ciphertext (`nonce(12) || ciphertext || tag(16)`) when the connection has
//! an established session key, otherwise the whole payload is cleartext
//! `<message_type><body>`. This byte collides with [`MessageType::Ping`]'s
//! own discriminator (`0x01`); the handshake resolves the ambiguity by
//! session state rather than by picking a non-colliding byte — see
//! `DESIGN.md`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::chunked_io::{ChunkInfo, TransferMetadata};
use crate::crypto;
use crate::error::{Error, Result};

/// Marker byte indicating the remainder of the payload is an AEAD ciphertext.
pub const ENCRYPTED_FLAG: u8 = 0x01;

/// Length of the frame's big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Hard ceiling on a single frame's payload, in bytes (128 MiB).
pub const MAX_FRAME_SIZE: usize = crate::MAX_FRAME_SIZE;

/// Hard ceiling on the parser's receive buffer before the connection is
/// dropped, in bytes (256 MiB).
pub const MAX_RECEIVE_BUFFER: usize = crate::MAX_RECEIVE_BUFFER;

/// The wire vocabulary. Cleartext forms are shown here; any of these may
/// also travel as the plaintext of an AEAD-encrypted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Keep-alive probe.
    Ping = 0x01,
    /// Keep-alive reply.
    Pong = 0x02,
    /// Direct bulk file transfer: `<4-byte meta-len><meta JSON><file bytes>`.
    FileTransfer = 0x10,
    /// Acknowledges a `FileTransfer`: `{success, message}`.
    FileAck = 0x11,
    /// Direct text transfer: `<4-byte text-len><UTF-8 bytes>`.
    TextTransfer = 0x12,
    /// Acknowledges a `TextTransfer`.
    TextAck = 0x13,
    /// Announces a lazy transfer's metadata.
    FileAnnounce = 0x14,
    /// Requests one file (or a resumed range of it) from an announced
    /// transfer.
    FileRequest = 0x15,
    /// One chunk of a requested file: `<4-byte chunk-meta-len><chunk meta
    /// JSON><chunk bytes>`.
    FileChunk = 0x16,
    /// Acknowledges receipt of one `FileChunk`.
    FileChunkAck = 0x17,
    /// Signals a transfer finished successfully.
    TransferComplete = 0x18,
    /// Signals either side cancelled a transfer.
    TransferCancel = 0x19,
    /// Signals a transfer failed.
    TransferError = 0x1A,
    /// First step of the session handshake: carries a random nonce.
    AuthChallenge = 0x30,
    /// Second step: carries the peer's computed digest.
    AuthResponse = 0x31,
    /// Handshake succeeded; all further frames are encrypted.
    AuthSuccess = 0x32,
    /// Handshake failed; the connection will close.
    AuthFailure = 0x33,
    /// Generic error notice, carries a human-readable message.
    ErrorNotice = 0xFF,
}

impl MessageType {
    /// Decode a message type from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x01 => Self::Ping,
            0x02 => Self::Pong,
            0x10 => Self::FileTransfer,
            0x11 => Self::FileAck,
            0x12 => Self::TextTransfer,
            0x13 => Self::TextAck,
            0x14 => Self::FileAnnounce,
            0x15 => Self::FileRequest,
            0x16 => Self::FileChunk,
            0x17 => Self::FileChunkAck,
            0x18 => Self::TransferComplete,
            0x19 => Self::TransferCancel,
            0x1A => Self::TransferError,
            0x30 => Self::AuthChallenge,
            0x31 => Self::AuthResponse,
            0x32 => Self::AuthSuccess,
            0x33 => Self::AuthFailure,
            0xFF => Self::ErrorNotice,
            other => return Err(Error::ProtocolError(format!("unknown message type 0x{other:02x}"))),
        })
    }

    /// Encode this message type to its wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Body of `FILE_ACK` / `TEXT_ACK`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Whether the transfer was accepted and stored.
    pub success: bool,
    /// Human-readable detail (error message on failure, empty on success).
    pub message: String,
}

/// Body of `FILE_REQUEST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestPayload {
    /// Transfer the request belongs to.
    pub transfer_id: Uuid,
    /// Index of the file within the transfer's file list.
    pub file_index: usize,
    /// Byte offset to start streaming from (0 for a fresh request).
    pub offset: u64,
}

/// Body of `TRANSFER_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCompletePayload {
    /// Transfer that finished.
    pub transfer_id: Uuid,
}

/// Body of `TRANSFER_CANCEL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCancelPayload {
    /// Transfer being cancelled.
    pub transfer_id: Uuid,
    /// Human-readable cancellation reason.
    pub reason: String,
}

/// Body of `TRANSFER_ERROR`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferErrorPayload {
    /// Transfer that failed.
    pub transfer_id: Uuid,
    /// Human-readable failure detail.
    pub message: String,
}

/// Body of `AUTH_FAILURE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailurePayload {
    /// Why the handshake failed.
    pub reason: String,
}

/// Encode a JSON sub-payload.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a JSON sub-payload, rejecting any value missing an expected key
/// (serde's derive already does this for non-`Option` fields, since the
/// field simply fails to populate).
pub fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::ProtocolError(format!("malformed JSON sub-payload: {e}")))
}

/// A fully decoded cleartext frame: message type plus body bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The message's type.
    pub message_type: MessageType,
    /// The message's body, not including the type byte.
    pub body: Vec<u8>,
}

/// Build the on-wire bytes for a cleartext frame:
/// `<4-byte length><message_type><body>`.
///
/// The message type byte must not collide with [`ENCRYPTED_FLAG`] when the
/// connection has no established session key; callers on an unauthenticated
/// connection must restrict themselves to the handshake message types
/// (`AUTH_CHALLENGE`, `AUTH_RESPONSE`, `AUTH_SUCCESS`, `AUTH_FAILURE`) plus
/// `PING`/`PONG`, matching the handshake window in which this module
/// disambiguates by session state rather than by wire byte.
#[must_use]
pub fn build_cleartext_frame(message_type: MessageType, body: &[u8]) -> Vec<u8> {
    let payload_len = 1 + body.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    out.push(message_type.to_byte());
    out.extend_from_slice(body);
    out
}

/// Build the on-wire bytes for an encrypted frame:
/// `<4-byte length><0x01><nonce(12) || ciphertext || tag(16)>`, where the
/// ciphertext is `<message_type><body>` sealed under `key`.
pub fn build_encrypted_frame(
    key: &[u8; crypto::KEY_SIZE],
    message_type: MessageType,
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(1 + body.len());
    plaintext.push(message_type.to_byte());
    plaintext.extend_from_slice(body);

    let sealed = crypto::encrypt(key, &plaintext)?;

    let payload_len = 1 + sealed.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    out.push(ENCRYPTED_FLAG);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decode one complete payload (everything after the length prefix) into a
/// [`Frame`]. `session_key` is `Some` once the handshake has established a
/// key; the `0x01` discriminator is only treated as [`ENCRYPTED_FLAG`] in
/// that case, so a plaintext `PING` (also `0x01`) during the handshake
/// window is read correctly.
pub fn decode_payload(payload: &[u8], session_key: Option<&[u8; crypto::KEY_SIZE]>) -> Result<Frame> {
    if payload.is_empty() {
        return Err(Error::ProtocolError("empty frame payload".to_string()));
    }

    let discriminator = payload[0];

    if discriminator == ENCRYPTED_FLAG {
        if let Some(key) = session_key {
            let plaintext = crypto::decrypt(key, &payload[1..])?;
            if plaintext.is_empty() {
                return Err(Error::ProtocolError("empty decrypted frame".to_string()));
            }
            let message_type = MessageType::from_byte(plaintext[0])?;
            return Ok(Frame {
                message_type,
                body: plaintext[1..].to_vec(),
            });
        }
    }

    let message_type = MessageType::from_byte(discriminator)?;
    Ok(Frame {
        message_type,
        body: payload[1..].to_vec(),
    })
}

/// Chunk size used by [`read_payload_capped`] to assemble a frame's payload
/// incrementally rather than in one `read_exact` of the full declared length.
const RECEIVE_CHUNK_SIZE: usize = 64 * 1024;

/// Read exactly `len` payload bytes off `reader` in [`RECEIVE_CHUNK_SIZE`]
/// increments, discarding the connection if the accumulated buffer would
/// ever exceed [`MAX_RECEIVE_BUFFER`]. `len` is already known to be at most
/// [`MAX_FRAME_SIZE`] by the time this is called, so the cap here is a
/// second, independent line of defense against an over-large receive
/// buffer rather than a check that fires in ordinary operation.
async fn read_payload_capped<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    if len > MAX_RECEIVE_BUFFER {
        return Err(Error::ProtocolError(format!(
            "frame payload of {len} bytes exceeds the {MAX_RECEIVE_BUFFER}-byte receive buffer ceiling"
        )));
    }

    let mut payload = Vec::with_capacity(len.min(RECEIVE_CHUNK_SIZE));
    while payload.len() < len {
        let take = (len - payload.len()).min(RECEIVE_CHUNK_SIZE);
        let start = payload.len();
        payload.resize(start + take, 0);
        reader.read_exact(&mut payload[start..]).await?;

        if payload.len() > MAX_RECEIVE_BUFFER {
            return Err(Error::ProtocolError(format!(
                "receive buffer exceeded {MAX_RECEIVE_BUFFER} bytes while assembling a frame"
            )));
        }
    }
    Ok(payload)
}

/// Read one frame from an async stream: a 4-byte big-endian length, then
/// that many payload bytes. Rejects lengths above [`MAX_FRAME_SIZE`]
/// without reading the body, and assembles the body in bounded increments
/// so the receive buffer itself never grows past [`MAX_RECEIVE_BUFFER`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    session_key: Option<&[u8; crypto::KEY_SIZE]>,
) -> Result<Frame> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(Error::ProtocolError(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte ceiling"
        )));
    }

    let payload = read_payload_capped(reader, len).await?;

    decode_payload(&payload, session_key)
}

/// [`read_frame`] bounded by a deadline.
pub async fn read_frame_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    session_key: Option<&[u8; crypto::KEY_SIZE]>,
    duration: Duration,
) -> Result<Frame> {
    timeout(duration, read_frame(reader, session_key))
        .await
        .map_err(|_| Error::Timeout(duration))?
}

/// Write a cleartext frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    body: &[u8],
) -> Result<()> {
    let bytes = build_cleartext_frame(message_type, body);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an encrypted frame and flush.
pub async fn write_encrypted_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &[u8; crypto::KEY_SIZE],
    message_type: MessageType,
    body: &[u8],
) -> Result<()> {
    let bytes = build_encrypted_frame(key, message_type, body)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// [`write_frame`] bounded by a deadline.
pub async fn write_frame_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    body: &[u8],
    duration: Duration,
) -> Result<()> {
    timeout(duration, write_frame(writer, message_type, body))
        .await
        .map_err(|_| Error::Timeout(duration))?
}

/// Encode a `FILE_TRANSFER` body: `<4-byte meta-len><meta JSON><file
/// bytes concatenated>`.
pub fn encode_file_transfer(metadata: &TransferMetadata, file_bytes: &[u8]) -> Result<Vec<u8>> {
    let meta_json = encode_json(metadata)?;
    let mut out = Vec::with_capacity(4 + meta_json.len() + file_bytes.len());
    out.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(file_bytes);
    Ok(out)
}

/// Decode a `FILE_TRANSFER` body back into its metadata and concatenated
/// file bytes.
pub fn decode_file_transfer(body: &[u8]) -> Result<(TransferMetadata, Vec<u8>)> {
    if body.len() < 4 {
        return Err(Error::ProtocolError("FILE_TRANSFER body too short".to_string()));
    }
    let meta_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let rest = &body[4..];
    if rest.len() < meta_len {
        return Err(Error::ProtocolError("FILE_TRANSFER metadata truncated".to_string()));
    }
    let metadata: TransferMetadata = decode_json(&rest[..meta_len])?;
    let file_bytes = rest[meta_len..].to_vec();
    Ok((metadata, file_bytes))
}

/// Encode a `TEXT_TRANSFER` body: `<4-byte text-len><UTF-8 bytes>`.
#[must_use]
pub fn encode_text_transfer(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Decode a `TEXT_TRANSFER` body back into a `String`.
pub fn decode_text_transfer(body: &[u8]) -> Result<String> {
    if body.len() < 4 {
        return Err(Error::ProtocolError("TEXT_TRANSFER body too short".to_string()));
    }
    let text_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let rest = &body[4..];
    if rest.len() < text_len {
        return Err(Error::ProtocolError("TEXT_TRANSFER body truncated".to_string()));
    }
    String::from_utf8(rest[..text_len].to_vec())
        .map_err(|e| Error::ProtocolError(format!("TEXT_TRANSFER is not valid UTF-8: {e}")))
}

/// Encode a `FILE_CHUNK` body: `<4-byte chunk-meta-len><chunk meta
/// JSON><chunk bytes>`.
pub fn encode_file_chunk(info: &ChunkInfo, data: &[u8]) -> Result<Vec<u8>> {
    let meta_json = encode_json(info)?;
    let mut out = Vec::with_capacity(4 + meta_json.len() + data.len());
    out.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(data);
    Ok(out)
}

/// Decode a `FILE_CHUNK` body back into its metadata and chunk bytes.
pub fn decode_file_chunk(body: &[u8]) -> Result<(ChunkInfo, Vec<u8>)> {
    if body.len() < 4 {
        return Err(Error::ProtocolError("FILE_CHUNK body too short".to_string()));
    }
    let meta_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
    let rest = &body[4..];
    if rest.len() < meta_len {
        return Err(Error::ProtocolError("FILE_CHUNK metadata truncated".to_string()));
    }
    let info: ChunkInfo = decode_json(&rest[..meta_len])?;
    let data = rest[meta_len..].to_vec();
    Ok((info, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked_io::FileInfo;

    #[test]
    fn test_message_type_roundtrip() {
        for byte in [
            0x01u8, 0x02, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x30,
            0x31, 0x32, 0x33, 0xFF,
        ] {
            let mt = MessageType::from_byte(byte).unwrap();
            assert_eq!(mt.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_message_type_fails() {
        assert!(MessageType::from_byte(0x99).is_err());
    }

    #[test]
    fn test_cleartext_frame_roundtrip() {
        let bytes = build_cleartext_frame(MessageType::Ping, &[]);
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);

        let frame = decode_payload(&bytes[4..], None).unwrap();
        assert_eq!(frame.message_type, MessageType::Ping);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_encrypted_frame_roundtrip() {
        let key = crypto::random_bytes::<{ crypto::KEY_SIZE }>();
        let bytes = build_encrypted_frame(&key, MessageType::TextTransfer, b"hello").unwrap();

        let frame = decode_payload(&bytes[4..], Some(&key)).unwrap();
        assert_eq!(frame.message_type, MessageType::TextTransfer);
        assert_eq!(frame.body, b"hello");
    }

    #[test]
    fn test_encrypted_frame_wrong_key_fails() {
        let key_a = crypto::random_bytes::<{ crypto::KEY_SIZE }>();
        let key_b = crypto::random_bytes::<{ crypto::KEY_SIZE }>();
        let bytes = build_encrypted_frame(&key_a, MessageType::Ping, &[]).unwrap();

        assert!(decode_payload(&bytes[4..], Some(&key_b)).is_err());
    }

    #[test]
    fn test_ping_byte_readable_without_session_key() {
        // PING (0x01) collides with ENCRYPTED_FLAG; before a session key is
        // established the byte must be read as plaintext PING, not as a
        // (missing) ciphertext.
        let bytes = build_cleartext_frame(MessageType::Ping, &[]);
        let frame = decode_payload(&bytes[4..], None).unwrap();
        assert_eq!(frame.message_type, MessageType::Ping);
    }

    #[test]
    fn test_oversize_frame_rejected_by_length() {
        let huge_len = (MAX_FRAME_SIZE + 1) as u32;
        assert!(huge_len as usize > MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_receive_buffer_ceiling_rejected_without_reading() {
        // A declared length past MAX_RECEIVE_BUFFER is rejected immediately,
        // before any body bytes are read off the stream.
        let (_client, mut server) = tokio::io::duplex(4096);
        let result = read_payload_capped(&mut server, MAX_RECEIVE_BUFFER + 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_payload_capped_assembles_in_chunks() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let payload = vec![7u8; 150_000];
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&expected).await.unwrap();
        });

        let assembled = read_payload_capped(&mut server, payload.len()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(assembled, payload);
    }

    #[test]
    fn test_file_transfer_body_roundtrip() {
        let metadata = TransferMetadata {
            files: vec![FileInfo {
                name: "a.txt".to_string(),
                size: 5,
                checksum_md5_hex: crate::chunked_io::md5_hex(b"hello"),
                is_directory: false,
                relative_path: "a.txt".to_string(),
                file_index: 0,
            }],
            total_size: 5,
            timestamp: 0,
            source_os: "linux".to_string(),
            transfer_id: Uuid::nil(),
            expires_at: 0,
            chunk_size: 1024,
        };

        let body = encode_file_transfer(&metadata, b"hello").unwrap();
        let (decoded_meta, decoded_bytes) = decode_file_transfer(&body).unwrap();
        assert_eq!(decoded_meta.files.len(), 1);
        assert_eq!(decoded_bytes, b"hello");
    }

    #[test]
    fn test_text_transfer_body_roundtrip() {
        let body = encode_text_transfer("hello, clipboard");
        let decoded = decode_text_transfer(&body).unwrap();
        assert_eq!(decoded, "hello, clipboard");
    }

    #[test]
    fn test_file_chunk_body_roundtrip() {
        let info = ChunkInfo {
            transfer_id: Uuid::nil(),
            file_index: 0,
            chunk_index: 2,
            offset: 2048,
            size: 4,
            checksum_md5_hex: crate::chunked_io::md5_hex(b"data"),
            is_last: true,
        };

        let body = encode_file_chunk(&info, b"data").unwrap();
        let (decoded_info, decoded_data) = decode_file_chunk(&body).unwrap();
        assert_eq!(decoded_info.chunk_index, 2);
        assert_eq!(decoded_data, b"data");
    }

    #[test]
    fn test_decode_json_missing_key_fails() {
        #[derive(Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            required: String,
        }
        let result: Result<Needs> = decode_json(b"{}");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_async_read_write_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, MessageType::TextTransfer, &encode_text_transfer("hi"))
            .await
            .unwrap();

        let frame = read_frame(&mut server, None).await.unwrap();
        assert_eq!(frame.message_type, MessageType::TextTransfer);
        assert_eq!(decode_text_transfer(&frame.body).unwrap(), "hi");
    }
}
