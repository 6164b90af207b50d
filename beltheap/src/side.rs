//! Side table: one state byte per fixed-size heap chunk.
//!
//! The table serves two roles. Between cycles it records where linearly
//! parseable blocks begin (a block is the memory one sequential
//! promotion or one retired evacuation buffer produced), which lets a
//! dirty-card scan find the first cell at or before an arbitrary card.
//! During parallel collection the START byte doubles as the unit of
//! work: a worker owns a block exactly when its compare-and-swap flips
//! the byte from START to SCAVENGED.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::Address;

/// Never covered by a block; the unallocated tail of a belt. Kept
/// distinct from MIDDLE so a block-end scan stops at the allocation
/// frontier even while a neighboring buffer is still being marked.
pub const CHUNK_FREE: u8 = 0;
/// First chunk of a parseable block; claimable by workers.
pub const CHUNK_START: u8 = 1;
/// Block is being formed; walkers must not enter yet.
pub const CHUNK_CREATING: u8 = 2;
/// Block has been claimed and fully visited this cycle.
pub const CHUNK_SCAVENGED: u8 = 3;
/// Interior of a block.
pub const CHUNK_MIDDLE: u8 = 4;

pub struct SideTable {
    coverage: Address,
    shift: u32,
    chunks: Box<[AtomicU8]>,
}

impl SideTable {
    pub fn new(coverage: Address, size: usize, chunk_size: usize) -> Self {
        assert!(chunk_size.is_power_of_two());
        assert!(size.is_multiple_of(chunk_size));
        let chunks = (0..size / chunk_size)
            .map(|_| AtomicU8::new(CHUNK_FREE))
            .collect();
        Self {
            coverage,
            shift: chunk_size.trailing_zeros(),
            chunks,
        }
    }

    #[inline(always)]
    pub fn index_of(&self, address: Address) -> usize {
        debug_assert!(address >= self.coverage);
        address.offset_from(self.coverage) >> self.shift
    }

    #[inline(always)]
    pub fn address_of(&self, index: usize) -> Address {
        self.coverage.plus(index << self.shift)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline(always)]
    pub fn state(&self, index: usize) -> u8 {
        self.chunks[index].load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_state(&self, index: usize, state: u8) {
        self.chunks[index].store(state, Ordering::Release);
    }

    /// Marks the block beginning at `start`: START on its first chunk,
    /// MIDDLE on the rest of `[start, end)`.
    pub fn mark_block(&self, start: Address, end: Address) {
        debug_assert!(end > start);
        let first = self.index_of(start);
        let last = self.index_of(end.minus(1));
        for i in first + 1..=last {
            self.set_state(i, CHUNK_MIDDLE);
        }
        // START becomes visible only after the interior is settled.
        self.set_state(first, CHUNK_START);
    }

    /// Marks the first chunk of a block being formed. Walkers skip
    /// CREATING chunks; [`SideTable::mark_block`] publishes it later.
    pub fn mark_creating(&self, start: Address) {
        self.set_state(self.index_of(start), CHUNK_CREATING);
    }

    /// The work-claim primitive: flips chunk `index` from START to
    /// SCAVENGED and reports the state seen before the attempt. Exactly
    /// one caller per chunk per cycle observes START.
    #[inline]
    pub fn compare_and_swap_start(&self, index: usize) -> u8 {
        match self.chunks[index].compare_exchange(
            CHUNK_START,
            CHUNK_SCAVENGED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prior) => prior,
            Err(prior) => prior,
        }
    }

    /// Claims the next unscavenged block start in `[search, stop)`,
    /// returning its chunk index.
    pub fn claim_next(&self, search: usize, stop: usize) -> Option<usize> {
        let stop = stop.min(self.chunks.len());
        for i in search..stop {
            if self.state(i) == CHUNK_START
                && self.compare_and_swap_start(i) == CHUNK_START
            {
                return Some(i);
            }
        }
        None
    }

    /// Index one past the last chunk of the block whose START chunk is
    /// `start_index`, bounded by `limit`. The block runs to the first
    /// chunk that is not its interior: the next block in any state, or
    /// FREE space.
    pub fn block_end_index(&self, start_index: usize, limit: usize) -> usize {
        let limit = limit.min(self.chunks.len());
        let mut i = start_index + 1;
        while i < limit && self.state(i) == CHUNK_MIDDLE {
            i += 1;
        }
        i
    }

    /// Finds the start address of the block containing `address` by
    /// walking back to its START chunk. Returns zero when the chunk
    /// already got scavenged this cycle or the block is still forming, in
    /// which case a card scan has nothing left to do there.
    pub fn block_start_for(&self, address: Address, floor: Address) -> Address {
        let floor_index = self.index_of(floor);
        let mut i = self.index_of(address);
        loop {
            match self.state(i) {
                CHUNK_START => return self.address_of(i),
                CHUNK_SCAVENGED | CHUNK_CREATING => return Address::zero(),
                _ => {}
            }
            if i == floor_index {
                return Address::zero();
            }
            i -= 1;
        }
    }

    /// Resets every chunk covering `[start, end)` to FREE. Used on the
    /// belt a collection just emptied, whose blocks are dead.
    pub fn reset_range(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let first = self.index_of(start);
        let last = self.index_of(end.minus(1));
        for i in first..=last {
            self.set_state(i, CHUNK_FREE);
        }
    }

    /// Rewinds SCAVENGED chunks in `[start, end)` back to START so the
    /// surviving blocks are claimable again next cycle.
    pub fn restore_scavenged_range(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let first = self.index_of(start);
        let last = self.index_of(end.minus(1));
        for i in first..=last {
            let _ = self.chunks[i].compare_exchange(
                CHUNK_SCAVENGED,
                CHUNK_START,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}
