/// Receiver side: requests one file and reconstructs it.
///
/// ```text
/// GET ──> sender
///         MET ──> size tracker, pre-size output file
///         DAT ──> [ChunkTracker] ── write at id * chunk_size
///                      │
///                      ├── REQ gap / timeout ──> sender
///                      └── ACK batch / flush ──> sender
/// ```
///
/// Single thread. Each iteration waits for a datagram until the next timer
/// (request retry, timeout sweep or idle limit), handles it, then runs
/// whatever timer fell due. Returns once every chunk is on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::TransferError;
use crate::logging::{TransferEvent, TransferLogger, emit};
use crate::protocol::{Chunk, Envelope, FileMetadata, MAX_DATAGRAM, MAX_FILENAME, Message};
use crate::stats::TransferStats;
use crate::tracker::{ChunkStatus, ChunkTracker, TrackerConfig};
use crate::transport::Transport;

const COMPONENT: &str = "receiver";

/// Default cap on the advertised chunk count.
pub const DEFAULT_MAX_CHUNKS: u32 = 16 * 1024 * 1024;

const RECV_BUFFER: usize = MAX_DATAGRAM + 64;

/// Configuration for the receiver.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub server: SocketAddr,
    /// Directory the file is written into, under the basename the sender reports.
    pub output_dir: PathBuf,
    pub tracker: TrackerConfig,
    /// Give up after this long without a datagram for the transfer. None waits forever.
    pub idle_timeout: Option<Duration>,
    /// Longest single wait on the socket.
    pub max_wait: Duration,
    /// Metadata advertising more chunks than this is refused.
    pub max_chunks: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 8080)),
            output_dir: PathBuf::from("."),
            tracker: TrackerConfig::default(),
            idle_timeout: None,
            max_wait: Duration::from_millis(500),
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub transfer_id: Uuid,
    pub path: PathBuf,
    pub metadata: FileMetadata,
    pub elapsed: Duration,
}

/// State once metadata has arrived.
struct Receiving {
    tracker: ChunkTracker,
    file: File,
    path: PathBuf,
}

/// Request `filename` from `config.server` and write it under `config.output_dir`.
pub fn receive_file<T: Transport>(
    transport: &T,
    config: &ReceiverConfig,
    filename: &str,
    stats: &TransferStats,
    logger: &dyn TransferLogger,
) -> Result<ReceiveOutcome, TransferError> {
    receive_with_id(transport, config, filename, Uuid::new_v4(), stats, logger)
}

fn receive_with_id<T: Transport>(
    transport: &T,
    config: &ReceiverConfig,
    filename: &str,
    tid: Uuid,
    stats: &TransferStats,
    logger: &dyn TransferLogger,
) -> Result<ReceiveOutcome, TransferError> {
    if filename.is_empty() || filename.len() > MAX_FILENAME {
        return Err(TransferError::InvalidFilename(filename.len()));
    }
    let mut rx = Receiver {
        transport,
        config,
        tid,
        stats,
        logger,
        state: None,
    };
    let resend_timeout = config.tracker.resend_timeout;

    let started = Instant::now();
    rx.request(filename)?;
    debug!(transfer_id = %tid, server = %config.server, filename, "transfer requested");

    let mut last_heard = started;
    // `None` wherever a configured duration runs past the clock's range.
    let mut request_due = started.checked_add(resend_timeout);
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let now = Instant::now();
        let timer = match &rx.state {
            None => request_due,
            Some(active) => active.tracker.next_due(),
        };
        let idle_deadline = config
            .idle_timeout
            .and_then(|idle| last_heard.checked_add(idle));
        let deadline = match (timer, idle_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let wait = match deadline {
            Some(deadline) => deadline.saturating_duration_since(now).min(config.max_wait),
            None => config.max_wait,
        };

        if let Some((len, src)) = transport.recv_timeout(&mut buf, wait)? {
            let now = Instant::now();
            if rx.on_datagram(&buf[..len], src, now)? {
                last_heard = now;
            }
        }

        let now = Instant::now();
        if rx.state.is_none() {
            // Request or metadata lost. Asking again restarts the transfer on the sender.
            if request_due.is_some_and(|due| now >= due) {
                debug!(transfer_id = %tid, "no metadata yet, repeating request");
                rx.request(filename)?;
                request_due = now.checked_add(resend_timeout);
            }
        } else if rx.is_complete() {
            let (path, metadata) = rx.complete()?;
            let elapsed = started.elapsed();
            emit(
                logger,
                COMPONENT,
                tid,
                TransferEvent::TransferComplete {
                    total_bytes: metadata.file_size,
                    duration_ms: elapsed.as_millis() as u64,
                    retransmits: stats.retransmits.load(Ordering::Relaxed),
                },
            );
            return Ok(ReceiveOutcome {
                transfer_id: tid,
                path,
                metadata,
                elapsed,
            });
        } else {
            rx.sweep(now)?;
        }

        if let Some(idle) = config.idle_timeout {
            if now.saturating_duration_since(last_heard) >= idle {
                return Err(TransferError::Idle(idle));
            }
        }
    }
}

/// Everything one transfer's handlers need.
struct Receiver<'a, T> {
    transport: &'a T,
    config: &'a ReceiverConfig,
    tid: Uuid,
    stats: &'a TransferStats,
    logger: &'a dyn TransferLogger,
    state: Option<Receiving>,
}

impl<T: Transport> Receiver<'_, T> {
    fn send(&self, message: Message) -> Result<(), TransferError> {
        let datagram = Envelope::new(self.tid, message).encode();
        self.transport.send_to(&datagram, self.config.server)?;
        Ok(())
    }

    fn request(&self, filename: &str) -> Result<(), TransferError> {
        self.send(Message::Request {
            filename: filename.to_string(),
        })
    }

    /// Count, log and send a control message.
    fn reply(&self, message: Message) -> Result<(), TransferError> {
        match message {
            Message::Ack { start, count } => {
                self.stats.record_ack();
                emit(self.logger, COMPONENT, self.tid, TransferEvent::Ack { start, count });
            }
            Message::Resend { chunk_id, reason } => {
                self.stats.record_retransmits(1);
                emit(
                    self.logger,
                    COMPONENT,
                    self.tid,
                    TransferEvent::ResendRequest { chunk_id, reason },
                );
            }
            _ => {}
        }
        self.send(message)
    }

    /// Handle one datagram. Returns whether it belonged to this transfer.
    fn on_datagram(&mut self, data: &[u8], src: SocketAddr, now: Instant) -> Result<bool, TransferError> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) if envelope.transfer_id == self.tid => envelope,
            Ok(envelope) => {
                trace!(peer = %src, transfer_id = %envelope.transfer_id, "datagram for another transfer");
                return Ok(false);
            }
            Err(e) => {
                trace!(peer = %src, error = %e, "dropping malformed datagram");
                return Ok(false);
            }
        };

        match envelope.message {
            Message::Metadata(meta) if self.state.is_none() => self.on_metadata(meta, now)?,
            Message::Chunk(chunk) => self.on_chunk(&chunk, now)?,
            Message::Reject(reason) => {
                emit(self.logger, COMPONENT, self.tid, TransferEvent::Rejected { reason });
                return Err(TransferError::Rejected(reason));
            }
            other => trace!(transfer_id = %self.tid, tag = ?other.tag(), "ignoring unexpected message"),
        }
        Ok(true)
    }

    fn on_metadata(&mut self, meta: FileMetadata, now: Instant) -> Result<(), TransferError> {
        if meta.total_chunks > self.config.max_chunks {
            return Err(TransferError::TooManyChunks {
                advertised: meta.total_chunks,
                limit: self.config.max_chunks,
            });
        }
        let path = output_path(&self.config.output_dir, &meta.filename)?;
        let file = create_output(&path, meta.file_size)?;
        self.stats.set_total(meta.file_size, meta.total_chunks as u64);
        emit(
            self.logger,
            COMPONENT,
            self.tid,
            TransferEvent::Metadata {
                filename: meta.filename.clone(),
                file_size: meta.file_size,
                total_chunks: meta.total_chunks,
            },
        );
        self.state = Some(Receiving {
            tracker: ChunkTracker::new(meta, self.config.tracker, now),
            file,
            path,
        });
        Ok(())
    }

    fn on_chunk(&mut self, chunk: &Chunk, now: Instant) -> Result<(), TransferError> {
        let Some(active) = self.state.as_mut() else {
            trace!(transfer_id = %self.tid, chunk_id = chunk.id, "chunk before metadata");
            return Ok(());
        };
        let reception = active.tracker.on_chunk(chunk, now, &mut active.file)?;
        match reception.status {
            ChunkStatus::New => self.stats.record_chunk(chunk.payload.len()),
            ChunkStatus::Duplicate => self.stats.record_duplicate(),
            ChunkStatus::Invalid => {
                trace!(transfer_id = %self.tid, chunk_id = chunk.id, "invalid chunk");
                return Ok(());
            }
        }
        emit(
            self.logger,
            COMPONENT,
            self.tid,
            TransferEvent::ChunkReceived {
                chunk_id: chunk.id,
                duplicate: reception.status == ChunkStatus::Duplicate,
            },
        );
        for reply in reception.replies {
            self.reply(reply)?;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.state.as_ref().is_some_and(|active| active.tracker.is_complete())
    }

    /// Send timeout requests if the tracker's sweep is due.
    fn sweep(&mut self, now: Instant) -> Result<(), TransferError> {
        let Some(active) = self.state.as_mut() else {
            return Ok(());
        };
        if !active.tracker.next_due().is_some_and(|due| now >= due) {
            return Ok(());
        }
        let requests = active.tracker.sweep(now);
        for request in requests {
            self.reply(request)?;
        }
        Ok(())
    }

    /// Flush the final ack and the file. Only called once every chunk is in.
    fn complete(&mut self) -> Result<(PathBuf, FileMetadata), TransferError> {
        let Some(mut active) = self.state.take() else {
            return Err(TransferError::Io(io::Error::other("transfer has no metadata")));
        };
        if let Some(ack) = active.tracker.flush_ack() {
            self.reply(ack)?;
        }
        active.file.flush()?;
        Ok((active.path, active.tracker.metadata().clone()))
    }
}

/// `dir` joined with the last component of the sender's filename.
fn output_path(dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let name = Path::new(filename)
        .file_name()
        .ok_or(TransferError::InvalidFilename(filename.len()))?;
    Ok(dir.join(name))
}

/// Create (or truncate) the output file and pre-size it.
fn create_output(path: &Path, size: u64) -> Result<File, TransferError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}
