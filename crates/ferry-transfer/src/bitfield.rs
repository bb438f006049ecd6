/// Per-transfer chunk tracking using a compact bitfield.
///
/// One bit per chunk id, sized from the advertised chunk count.
/// Unlike a fixed array this grows with the file, so the receiver's
/// chunk limit bounds the allocation (16M chunks = 2 MiB of words).

/// Compact bitfield tracking which chunks have been received.
#[derive(Clone, Debug)]
pub struct ChunkBitfield {
    bits: Vec<u64>,
    chunk_count: u32,
    received_count: u32,
}

impl ChunkBitfield {
    /// Create a new bitfield for a file with `chunk_count` chunks.
    pub fn new(chunk_count: u32) -> Self {
        let words = (chunk_count as usize).div_ceil(64);
        Self {
            bits: vec![0u64; words],
            chunk_count,
            received_count: 0,
        }
    }

    /// Mark a chunk as received. Returns true if it was newly received (not duplicate).
    #[inline]
    pub fn set(&mut self, chunk_id: u32) -> bool {
        if chunk_id >= self.chunk_count {
            return false;
        }
        let (word, mask) = locate(chunk_id);
        if self.bits[word] & mask != 0 {
            return false; // already set
        }
        self.bits[word] |= mask;
        self.received_count += 1;
        true
    }

    /// Check if a chunk has been received.
    #[inline]
    pub fn get(&self, chunk_id: u32) -> bool {
        if chunk_id >= self.chunk_count {
            return false;
        }
        let (word, mask) = locate(chunk_id);
        self.bits[word] & mask != 0
    }

    /// Returns true if all chunks have been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.chunk_count
    }

    #[inline]
    pub fn received(&self) -> u32 {
        self.received_count
    }

    /// First chunk id at or after `start` that has not been received,
    /// or the chunk count if every chunk from `start` on is present.
    pub fn first_missing_from(&self, start: u32) -> u32 {
        let total = self.chunk_count as usize;
        let mut idx = start as usize;
        while idx < total {
            let word = idx / 64;
            // Skip whole words that are full from this bit upwards.
            let rest = self.bits[word] | ((1u64 << (idx % 64)) - 1);
            if rest == u64::MAX {
                idx = (word + 1) * 64;
                continue;
            }
            let found = word * 64 + (!rest).trailing_zeros() as usize;
            return found.min(total) as u32;
        }
        self.chunk_count
    }
}

#[inline]
fn locate(chunk_id: u32) -> (usize, u64) {
    let idx = chunk_id as usize;
    (idx / 64, 1u64 << (idx % 64))
}
