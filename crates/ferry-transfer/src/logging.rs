/// Transfer logging trait for structured event logs.
///
/// Both sides report what happens to a transfer as [`TransferEvent`]s so the
/// binaries can route them to `tracing` and tests can silence them.

use std::fmt;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::protocol::{RejectReason, ResendReason};

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: Uuid,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: request accepted from a peer
    RequestReceived {
        filename: String,
        peer: SocketAddr,
    },
    /// Sender: metadata sent / Receiver: metadata received
    Metadata {
        filename: String,
        file_size: u64,
        total_chunks: u32,
    },
    /// Sender: chunk sent for the first time
    ChunkSent {
        chunk_id: u32,
        len: usize,
    },
    /// Receiver: chunk arrived
    ChunkReceived {
        chunk_id: u32,
        duplicate: bool,
    },
    /// Cumulative acknowledgment sent or applied
    Ack {
        start: u32,
        count: u32,
    },
    /// Receiver: resend requested / Sender: resend request received
    ResendRequest {
        chunk_id: u32,
        reason: ResendReason,
    },
    /// Sender: chunk retransmitted from the store
    ChunkResent {
        chunk_id: u32,
    },
    /// Sender: stale records force-acknowledged
    RecordsEvicted {
        count: usize,
    },
    /// Sender: an unacknowledged record was overwritten by an aliasing id
    RecordDisplaced {
        displaced: u32,
        by: u32,
    },
    /// Sender: transfer refused or abandoned
    Rejected {
        reason: RejectReason,
    },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
        retransmits: u64,
    },
    /// Sender: session drained only because stale records were evicted
    TransferIncomplete {
        total_chunks: u32,
        evicted: usize,
        duration_ms: u64,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestReceived { filename, peer } => {
                write!(f, "request file={} peer={}", filename, peer)
            }
            Self::Metadata { filename, file_size, total_chunks } => {
                write!(f, "metadata file={} size={} chunks={}", filename, file_size, total_chunks)
            }
            Self::ChunkSent { chunk_id, len } => {
                write!(f, "chunk_sent id={} len={}", chunk_id, len)
            }
            Self::ChunkReceived { chunk_id, duplicate } => {
                write!(f, "chunk_received id={} duplicate={}", chunk_id, duplicate)
            }
            Self::Ack { start, count } => {
                write!(f, "ack start={} count={}", start, count)
            }
            Self::ResendRequest { chunk_id, reason } => {
                write!(f, "resend_request id={} reason={}", chunk_id, reason)
            }
            Self::ChunkResent { chunk_id } => {
                write!(f, "chunk_resent id={}", chunk_id)
            }
            Self::RecordsEvicted { count } => {
                write!(f, "records_evicted count={}", count)
            }
            Self::RecordDisplaced { displaced, by } => {
                write!(f, "record_displaced id={} by={}", displaced, by)
            }
            Self::Rejected { reason } => {
                write!(f, "rejected: {}", reason)
            }
            Self::TransferComplete { total_bytes, duration_ms, retransmits } => {
                write!(f, "transfer_complete bytes={} duration_ms={} retransmits={}", total_bytes, duration_ms, retransmits)
            }
            Self::TransferIncomplete { total_chunks, evicted, duration_ms } => {
                write!(f, "transfer_incomplete chunks={} evicted={} duration_ms={}", total_chunks, evicted, duration_ms)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing or
/// discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Use info for key lifecycle events, debug for per-chunk spam
        match &entry.event {
            TransferEvent::RequestReceived { .. }
            | TransferEvent::Metadata { .. }
            | TransferEvent::RecordsEvicted { .. }
            | TransferEvent::RecordDisplaced { .. }
            | TransferEvent::Rejected { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::TransferIncomplete { .. }
            | TransferEvent::Error { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Shorthand for building and logging an entry.
pub(crate) fn emit(
    logger: &dyn TransferLogger,
    component: &'static str,
    transfer_id: Uuid,
    event: TransferEvent,
) {
    logger.log(TransferLog {
        component,
        transfer_id,
        event,
    });
}
