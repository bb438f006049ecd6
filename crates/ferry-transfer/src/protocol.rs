//! Wire format for ferry datagrams.
//!
//! ```text
//! [0..3]   Tag (ASCII): GET | MET | DAT | ACK | REQ | ERR
//! [3..19]  Transfer ID (UUID, 16 bytes)
//! [19..]   Message body, integers big-endian
//! ```
//!
//! Bodies:
//!
//! ```text
//! GET  filename bytes (1..=255, UTF-8)
//! MET  filename[256] NUL padded | file_size u64 | chunk_size u32 | total_chunks u32
//! DAT  chunk_id u32 | length u32 | payload
//! ACK  start u32 | count u32
//! REQ  chunk_id u32 | is_timeout u32 (0 = gap, 1 = timeout)
//! ERR  reason u32
//! ```
//!
//! 19-byte header + 8-byte chunk prefix + up to 1400 bytes payload = 1427 bytes max.
//! Well within 1472-byte MTU limit (1500 - 20 IP - 8 UDP).

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{DecodeError, TransferError};

/// Tag length in bytes.
pub const TAG_LEN: usize = 3;

/// Header size in bytes (tag + transfer id).
pub const HEADER_LEN: usize = TAG_LEN + 16;

/// Width of the fixed filename field in metadata.
pub const FILENAME_FIELD: usize = 256;

/// Longest filename, leaving room for the terminator.
pub const MAX_FILENAME: usize = FILENAME_FIELD - 1;

/// Chunk size used when the sender is not configured otherwise.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

/// Maximum payload bytes per chunk.
pub const MAX_CHUNK_SIZE: u32 = 1400;

/// Largest datagram either side ever sends.
pub const MAX_DATAGRAM: usize = HEADER_LEN + 8 + MAX_CHUNK_SIZE as usize;

pub const TAG_REQUEST: [u8; TAG_LEN] = *b"GET";
pub const TAG_METADATA: [u8; TAG_LEN] = *b"MET";
pub const TAG_CHUNK: [u8; TAG_LEN] = *b"DAT";
pub const TAG_ACK: [u8; TAG_LEN] = *b"ACK";
pub const TAG_RESEND: [u8; TAG_LEN] = *b"REQ";
pub const TAG_REJECT: [u8; TAG_LEN] = *b"ERR";

/// ceil(file_size / chunk_size). None when chunk_size is 0 or the count overflows u32.
pub fn chunk_count(file_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(file_size.div_ceil(chunk_size as u64)).ok()
}

/// Describes the file being transferred. Sent once, before any chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl FileMetadata {
    pub fn new(
        filename: impl Into<String>,
        file_size: u64,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        debug_assert!(chunk_size > 0 && chunk_size <= MAX_CHUNK_SIZE);
        let filename = filename.into();
        if filename.is_empty() || filename.len() > MAX_FILENAME {
            return Err(TransferError::InvalidFilename(filename.len()));
        }
        let total_chunks = chunk_count(file_size, chunk_size)
            .ok_or(TransferError::FileTooLarge { file_size, chunk_size })?;
        Ok(Self {
            filename,
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    /// Byte offset of a chunk in the file.
    pub fn offset_of(&self, chunk_id: u32) -> u64 {
        chunk_id as u64 * self.chunk_size as u64
    }

    /// Expected payload length of a chunk, or None if the id is out of range.
    pub fn chunk_len(&self, chunk_id: u32) -> Option<usize> {
        if chunk_id >= self.total_chunks {
            return None;
        }
        let remaining = self.file_size - self.offset_of(chunk_id);
        Some(remaining.min(self.chunk_size as u64) as usize)
    }
}

/// One slice of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendReason {
    /// The chunk's successor arrived first.
    Gap,
    /// The chunk stayed missing past the resend timeout.
    Timeout,
}

impl ResendReason {
    pub fn flag(self) -> u32 {
        match self {
            Self::Gap => 0,
            Self::Timeout => 1,
        }
    }

    pub fn from_flag(flag: u32) -> Option<Self> {
        match flag {
            0 => Some(Self::Gap),
            1 => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ResendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gap => f.write_str("gap"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Why the sender refused or abandoned a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    TooManyChunks,
    RetriesExhausted,
    InvalidName,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            Self::NotFound => 1,
            Self::TooManyChunks => 2,
            Self::RetriesExhausted => 3,
            Self::InvalidName => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::NotFound),
            2 => Some(Self::TooManyChunks),
            3 => Some(Self::RetriesExhausted),
            4 => Some(Self::InvalidName),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("file not found or unreadable"),
            Self::TooManyChunks => f.write_str("file has more chunks than the sender can track"),
            Self::RetriesExhausted => f.write_str("retransmission attempts exhausted"),
            Self::InvalidName => f.write_str("filename not allowed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request { filename: String },
    Metadata(FileMetadata),
    Chunk(Chunk),
    Ack { start: u32, count: u32 },
    Resend { chunk_id: u32, reason: ResendReason },
    Reject(RejectReason),
}

impl Message {
    pub fn tag(&self) -> [u8; TAG_LEN] {
        match self {
            Self::Request { .. } => TAG_REQUEST,
            Self::Metadata(_) => TAG_METADATA,
            Self::Chunk(_) => TAG_CHUNK,
            Self::Ack { .. } => TAG_ACK,
            Self::Resend { .. } => TAG_RESEND,
            Self::Reject(_) => TAG_REJECT,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Request { filename } => filename.len(),
            Self::Metadata(_) => FILENAME_FIELD + 16,
            Self::Chunk(chunk) => 8 + chunk.payload.len(),
            Self::Ack { .. } | Self::Resend { .. } => 8,
            Self::Reject(_) => 4,
        }
    }
}

/// A message together with the transfer it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub transfer_id: Uuid,
    pub message: Message,
}

impl Envelope {
    pub fn new(transfer_id: Uuid, message: Message) -> Self {
        Self {
            transfer_id,
            message,
        }
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.message.body_len());
        buf.put_slice(&self.message.tag());
        buf.put_slice(self.transfer_id.as_bytes());

        match &self.message {
            Message::Request { filename } => buf.put_slice(filename.as_bytes()),
            Message::Metadata(meta) => {
                let mut field = [0u8; FILENAME_FIELD];
                let name = meta.filename.as_bytes();
                let len = name.len().min(MAX_FILENAME);
                field[..len].copy_from_slice(&name[..len]);
                buf.put_slice(&field);
                buf.put_u64(meta.file_size);
                buf.put_u32(meta.chunk_size);
                buf.put_u32(meta.total_chunks);
            }
            Message::Chunk(chunk) => {
                buf.put_u32(chunk.id);
                buf.put_u32(chunk.payload.len() as u32);
                buf.put_slice(&chunk.payload);
            }
            Message::Ack { start, count } => {
                buf.put_u32(*start);
                buf.put_u32(*count);
            }
            Message::Resend { chunk_id, reason } => {
                buf.put_u32(*chunk_id);
                buf.put_u32(reason.flag());
            }
            Message::Reject(reason) => buf.put_u32(reason.code()),
        }

        buf.freeze()
    }

    /// Parse from wire format.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        ensure(buf, HEADER_LEN)?;

        let mut tag = [0u8; TAG_LEN];
        buf.copy_to_slice(&mut tag);
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let transfer_id = Uuid::from_bytes(id);

        let message = match tag {
            TAG_REQUEST => Message::Request {
                filename: decode_filename(buf)?,
            },
            TAG_METADATA => {
                ensure(buf, FILENAME_FIELD + 16)?;
                let field = &buf[..FILENAME_FIELD];
                let end = field
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(DecodeError::InvalidFilename)?;
                let filename = decode_filename(&field[..end])?;
                buf.advance(FILENAME_FIELD);

                let file_size = buf.get_u64();
                let chunk_size = buf.get_u32();
                let total_chunks = buf.get_u32();
                if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                    return Err(DecodeError::InconsistentMetadata("chunk size out of range"));
                }
                if chunk_count(file_size, chunk_size) != Some(total_chunks) {
                    return Err(DecodeError::InconsistentMetadata(
                        "total_chunks does not match file size",
                    ));
                }
                Message::Metadata(FileMetadata {
                    filename,
                    file_size,
                    chunk_size,
                    total_chunks,
                })
            }
            TAG_CHUNK => {
                ensure(buf, 8)?;
                let id = buf.get_u32();
                let len = buf.get_u32() as usize;
                if len > MAX_CHUNK_SIZE as usize {
                    return Err(DecodeError::PayloadTooLarge(len));
                }
                ensure(buf, len)?;
                Message::Chunk(Chunk {
                    id,
                    payload: Bytes::copy_from_slice(&buf[..len]),
                })
            }
            TAG_ACK => {
                ensure(buf, 8)?;
                Message::Ack {
                    start: buf.get_u32(),
                    count: buf.get_u32(),
                }
            }
            TAG_RESEND => {
                ensure(buf, 8)?;
                let chunk_id = buf.get_u32();
                let flag = buf.get_u32();
                let reason = ResendReason::from_flag(flag).ok_or(DecodeError::InvalidReason(flag))?;
                Message::Resend { chunk_id, reason }
            }
            TAG_REJECT => {
                ensure(buf, 4)?;
                let code = buf.get_u32();
                Message::Reject(
                    RejectReason::from_code(code).ok_or(DecodeError::UnknownRejectCode(code))?,
                )
            }
            other => return Err(DecodeError::UnknownTag(other)),
        };

        Ok(Self {
            transfer_id,
            message,
        })
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn decode_filename(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.is_empty() || bytes.len() > MAX_FILENAME {
        return Err(DecodeError::InvalidFilename);
    }
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidFilename)
}
