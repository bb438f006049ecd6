/// Sender-side chunk ring for retransmission.
///
/// Chunk `id` lives in slot `id % capacity`. A transfer's ring holds
/// `min(total_chunks, ring_capacity)` slots, so ids only share a slot when the
/// file has more chunks than the configured capacity (see [`OverflowPolicy`]).

use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::ConfigError;
use crate::protocol::Chunk;

/// Default number of ring slots per transfer.
pub const DEFAULT_RING_CAPACITY: usize = 65536;

/// What the dispatcher does when a file has more chunks than ring slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the request with `Reject(TooManyChunks)`.
    #[default]
    Reject,
    /// Dispatch anyway. Later ids overwrite earlier ones in the same slot.
    Alias,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "alias" => Ok(Self::Alias),
            _ => Err(ConfigError::Unrecognised {
                what: "overflow policy",
                value: s.to_string(),
            }),
        }
    }
}

/// How the stale sweep treats records nobody acknowledged in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Mark stale records acknowledged and forget them.
    #[default]
    ForceAck,
    /// Retransmit stale records until `max_attempts`, then fail the transfer.
    RetryThenFail { max_attempts: u32 },
    /// Keep stale records until acknowledged or the session expires.
    Retain,
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    /// Accepts `force-ack`, `retain` or `retry:N` with N >= 1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        let unrecognised = || ConfigError::Unrecognised {
            what: "eviction policy",
            value: s.to_string(),
        };
        match value.as_str() {
            "force-ack" => Ok(Self::ForceAck),
            "retain" => Ok(Self::Retain),
            other => {
                let n = other.strip_prefix("retry:").ok_or_else(unrecognised)?;
                match n.parse::<u32>() {
                    Ok(max_attempts) if max_attempts > 0 => Ok(Self::RetryThenFail { max_attempts }),
                    _ => Err(unrecognised()),
                }
            }
        }
    }
}

/// A sent chunk waiting for acknowledgment.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    /// Last time the chunk was sent or refreshed.
    pub sent_at: Instant,
    pub acknowledged: bool,
    /// Retransmissions so far. The first send is not counted.
    pub attempts: u32,
}

/// Result of one stale sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Ids force-acknowledged under `ForceAck`.
    pub evicted: Vec<u32>,
    /// Chunks to send again under `RetryThenFail`. Their records are already refreshed.
    pub retransmit: Vec<Chunk>,
    /// First id found out of attempts under `RetryThenFail`. The transfer should be abandoned.
    pub exhausted: Option<u32>,
    /// When the next record goes stale, if any can.
    pub next_due: Option<Instant>,
}

pub struct ChunkStore {
    slots: Vec<Option<ChunkRecord>>,
    outstanding: usize,
}

impl ChunkStore {
    /// Ring for a transfer of `total_chunks`, capped at `capacity` slots.
    pub fn new(total_chunks: u32, capacity: usize) -> Self {
        let len = (total_chunks as usize).min(capacity);
        Self {
            slots: vec![None; len],
            outstanding: 0,
        }
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, chunk_id: u32) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        Some(chunk_id as usize % self.slots.len())
    }

    /// Store a freshly sent chunk. Returns the id of an unacknowledged
    /// record it displaced, which only happens when ids alias.
    pub fn insert(&mut self, chunk: Chunk, now: Instant) -> Option<u32> {
        let slot = self.slot_of(chunk.id)?;
        let record = ChunkRecord {
            chunk,
            sent_at: now,
            acknowledged: false,
            attempts: 0,
        };
        let displaced = match self.slots[slot].replace(record) {
            Some(old) if !old.acknowledged => Some(old.chunk.id),
            _ => None,
        };
        if displaced.is_none() {
            self.outstanding += 1;
        }
        displaced
    }

    /// Mark slots for ids `[start, start + count)` acknowledged. Returns how
    /// many records flipped. The slot's current occupant is not checked.
    pub fn acknowledge(&mut self, start: u32, count: u32) -> usize {
        let len = self.slots.len();
        // Past `len` ids the same slots come round again.
        let n = (count as usize).min(len);
        let mut flipped = 0;
        for i in 0..n {
            let slot = (start as usize + i) % len;
            if let Some(record) = self.slots[slot].as_mut() {
                if !record.acknowledged {
                    record.acknowledged = true;
                    flipped += 1;
                }
            }
        }
        self.outstanding -= flipped;
        flipped
    }

    /// The chunk to resend for a request naming `chunk_id`, refreshing its
    /// record. None when the slot is empty or already acknowledged.
    pub fn resend(&mut self, chunk_id: u32, now: Instant) -> Option<Chunk> {
        let slot = self.slot_of(chunk_id)?;
        let record = self.slots[slot].as_mut()?;
        if record.acknowledged {
            return None;
        }
        record.sent_at = now;
        record.attempts += 1;
        Some(record.chunk.clone())
    }

    /// Apply `policy` to every unacknowledged record older than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration, policy: EvictionPolicy) -> Sweep {
        let mut sweep = Sweep::default();
        if policy == EvictionPolicy::Retain {
            return sweep;
        }

        for record in self.slots.iter_mut().flatten() {
            if record.acknowledged {
                continue;
            }
            if now.saturating_duration_since(record.sent_at) > timeout {
                match policy {
                    EvictionPolicy::ForceAck => {
                        record.acknowledged = true;
                        self.outstanding -= 1;
                        sweep.evicted.push(record.chunk.id);
                        continue;
                    }
                    EvictionPolicy::RetryThenFail { max_attempts } => {
                        if record.attempts >= max_attempts {
                            sweep.exhausted = Some(record.chunk.id);
                            return sweep;
                        }
                        record.attempts += 1;
                        record.sent_at = now;
                        sweep.retransmit.push(record.chunk.clone());
                    }
                    EvictionPolicy::Retain => {}
                }
            }
            if let Some(due) = record.sent_at.checked_add(timeout) {
                sweep.next_due = Some(sweep.next_due.map_or(due, |d| d.min(due)));
            }
        }
        sweep
    }

    /// Records sent but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// True once every stored record is acknowledged.
    pub fn is_drained(&self) -> bool {
        self.outstanding == 0
    }

    /// The record currently in `chunk_id`'s slot, whichever id it holds.
    pub fn record(&self, chunk_id: u32) -> Option<&ChunkRecord> {
        let slot = self.slot_of(chunk_id)?;
        self.slots[slot].as_ref()
    }
}
