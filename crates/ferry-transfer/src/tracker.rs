//! Receiver-side chunk tracking.
//!
//! [`ChunkTracker`] records which chunks of one transfer have arrived, writes
//! them at their offset, batches cumulative acknowledgments and decides when
//! a missing chunk should be requested again:
//!
//! - **Gap**: chunk `id` arrives while `id - 1` is missing.
//! - **Timeout**: a missing chunk saw no activity for `resend_timeout`. Its
//!   activity time is then pushed `suppression` into the future.

use std::io::{self, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use crate::bitfield::ChunkBitfield;
use crate::protocol::{Chunk, FileMetadata, Message, ResendReason};

pub const DEFAULT_ACK_BATCH: u32 = 10;
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SUPPRESSION: Duration = Duration::from_secs(9999);

/// Random-access destination for chunk payloads.
pub trait ChunkSink {
    fn write_chunk(&mut self, offset: u64, payload: &[u8]) -> io::Result<()>;
}

impl<W: Write + Seek> ChunkSink for W {
    fn write_chunk(&mut self, offset: u64, payload: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(payload)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Newly arrived chunks between acknowledgment attempts.
    pub ack_batch: u32,
    /// Inactivity before a missing chunk is requested again.
    pub resend_timeout: Duration,
    /// How far a timeout request pushes the chunk's activity time.
    pub suppression: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ack_batch: DEFAULT_ACK_BATCH,
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
            suppression: DEFAULT_SUPPRESSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// First copy, written to the sink.
    New,
    Duplicate,
    /// Out of range or wrong length. Nothing else happened.
    Invalid,
}

/// What one chunk did, plus the control messages to send back.
#[derive(Debug)]
pub struct Reception {
    pub status: ChunkStatus,
    pub replies: Vec<Message>,
}

pub struct ChunkTracker {
    meta: FileMetadata,
    config: TrackerConfig,
    received: ChunkBitfield,
    /// Receipt time, or last request time for missing chunks. `None` once a
    /// suppression pushed it past the clock's range.
    activity: Vec<Option<Instant>>,
    /// Chunks `0..acked` have been cumulatively acknowledged.
    acked: u32,
    /// Newly arrived chunks since the last ack attempt.
    fresh: u32,
    next_due: Option<Instant>,
}

impl ChunkTracker {
    /// Start tracking a transfer whose metadata arrived at `now`.
    pub fn new(meta: FileMetadata, config: TrackerConfig, now: Instant) -> Self {
        let total = meta.total_chunks;
        let next_due = if total > 0 {
            now.checked_add(config.resend_timeout)
        } else {
            None
        };
        Self {
            received: ChunkBitfield::new(total),
            activity: vec![Some(now); total as usize],
            acked: 0,
            fresh: 0,
            next_due,
            meta,
            config: TrackerConfig {
                ack_batch: config.ack_batch.max(1),
                ..config
            },
        }
    }

    /// Handle one chunk datagram. Replies are ordered: duplicate ack, gap
    /// request, batch ack.
    pub fn on_chunk(
        &mut self,
        chunk: &Chunk,
        now: Instant,
        sink: &mut impl ChunkSink,
    ) -> io::Result<Reception> {
        let mut replies = Vec::new();
        let id = chunk.id;

        match self.meta.chunk_len(id) {
            Some(len) if len == chunk.payload.len() => {}
            _ => {
                return Ok(Reception {
                    status: ChunkStatus::Invalid,
                    replies,
                });
            }
        }

        let status = if self.received.get(id) {
            // Our cumulative ack for it may have been lost.
            if id < self.acked {
                replies.push(Message::Ack { start: id, count: 1 });
            }
            ChunkStatus::Duplicate
        } else {
            sink.write_chunk(self.meta.offset_of(id), &chunk.payload)?;
            self.received.set(id);
            self.activity[id as usize] = Some(now);
            self.fresh += 1;
            ChunkStatus::New
        };

        if id > 0 && !self.received.get(id - 1) {
            replies.push(Message::Resend {
                chunk_id: id - 1,
                reason: ResendReason::Gap,
            });
        }

        if self.fresh >= self.config.ack_batch {
            self.fresh = 0;
            replies.extend(self.advance());
        }

        Ok(Reception { status, replies })
    }

    /// Acknowledge the run of received chunks after the checkpoint, if any.
    fn advance(&mut self) -> Option<Message> {
        let end = self.received.first_missing_from(self.acked);
        if end == self.acked {
            return None;
        }
        let ack = Message::Ack {
            start: self.acked,
            count: end - self.acked,
        };
        self.acked = end;
        Some(ack)
    }

    /// Acknowledge whatever tail the batch counter has not covered yet.
    pub fn flush_ack(&mut self) -> Option<Message> {
        self.fresh = 0;
        self.advance()
    }

    /// Request every missing chunk past the checkpoint whose activity is at
    /// least `resend_timeout` old, and suppress it for `suppression`.
    pub fn sweep(&mut self, now: Instant) -> Vec<Message> {
        let mut requests = Vec::new();
        let mut next_due: Option<Instant> = None;
        let total = self.meta.total_chunks;

        let resend_timeout = self.config.resend_timeout;
        let start = self.received.first_missing_from(self.acked);
        for id in start..total {
            if self.received.get(id) {
                continue;
            }
            let activity = &mut self.activity[id as usize];
            let Some(mut due) = activity.and_then(|at| at.checked_add(resend_timeout)) else {
                continue;
            };
            if now >= due {
                requests.push(Message::Resend {
                    chunk_id: id,
                    reason: ResendReason::Timeout,
                });
                *activity = now.checked_add(self.config.suppression);
                match activity.and_then(|at| at.checked_add(resend_timeout)) {
                    Some(next) => due = next,
                    None => continue,
                }
            }
            next_due = Some(next_due.map_or(due, |d| d.min(due)));
        }

        self.next_due = next_due;
        requests
    }

    /// Earliest instant a sweep could produce a request.
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Largest id such that every chunk up to it has been acknowledged.
    pub fn checkpoint(&self) -> Option<u32> {
        self.acked.checked_sub(1)
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_complete()
    }

    pub fn received(&self) -> u32 {
        self.received.received()
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.meta
    }
}
