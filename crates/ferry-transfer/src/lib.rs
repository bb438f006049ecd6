//! Ferry: reliable file transfer over unreliable UDP datagrams.
//!
//! Provides chunked file delivery without a stream transport:
//! - Tagged wire envelope carrying a per-transfer UUID
//! - Sender-side chunk ring with ack/resend handling and stale sweeps
//! - Receiver-side chunk tracker with batched cumulative acks
//! - Gap-triggered and timeout-triggered resend requests
//! - Session table keyed by (peer address, transfer id)

pub mod bitfield;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod store;
pub mod tracker;
pub mod transport;

// Re-export key types for convenience.
pub use bitfield::ChunkBitfield;
pub use error::{ConfigError, DecodeError, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferLogger};
pub use protocol::{
    Chunk, Envelope, FileMetadata, Message, RejectReason, ResendReason, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MAX_DATAGRAM, MAX_FILENAME,
};
pub use receiver::{ReceiveOutcome, ReceiverConfig, receive_file};
pub use sender::{ChunkServer, SenderConfig};
pub use session::{SessionKey, SessionTable};
pub use stats::TransferStats;
pub use store::{ChunkRecord, ChunkStore, EvictionPolicy, OverflowPolicy, Sweep};
pub use tracker::{ChunkSink, ChunkStatus, ChunkTracker, Reception, TrackerConfig};
pub use transport::{Transport, bind_udp};
