use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::RejectReason;

/// Why a datagram could not be decoded. The transfer loops drop these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message tag {0:?}")]
    UnknownTag([u8; 3]),
    #[error("filename is empty, too long or not UTF-8")]
    InvalidFilename,
    #[error("chunk payload of {0} bytes exceeds the maximum chunk size")]
    PayloadTooLarge(usize),
    #[error("invalid resend reason flag {0}")]
    InvalidReason(u32),
    #[error("unknown reject code {0}")]
    UnknownRejectCode(u32),
    #[error("metadata is inconsistent: {0}")]
    InconsistentMetadata(&'static str),
}

/// Failures of a transfer operation on either side.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid filename ({0} bytes, must be 1..=255)")]
    InvalidFilename(usize),
    #[error("file of {file_size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    FileTooLarge { file_size: u64, chunk_size: u32 },
    #[error("sender advertised {advertised} chunks, limit is {limit}")]
    TooManyChunks { advertised: u32, limit: u32 },
    #[error("transfer rejected by sender: {0}")]
    Rejected(RejectReason),
    #[error("nothing heard from sender for {0:?}")]
    Idle(Duration),
}

/// A configuration value that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognised {what}: {value:?}")]
    Unrecognised { what: &'static str, value: String },
    #[error("invalid {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
