//! Card table: one dirty byte per fixed-size span of heap.
//!
//! The mutator write barrier dirties the card covering the written slot;
//! a young collection then only scans elder-belt spans whose card is
//! dirty instead of walking entire elder belts. Dirtying is an
//! unconditional relaxed byte store so the barrier stays a handful of
//! instructions.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::Address;

pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 1;

pub struct CardTable {
    /// First heap address covered by card 0.
    coverage: Address,
    /// log2 of the span each card covers.
    shift: u32,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Builds a table covering `[coverage, coverage + size)` with one card
    /// per `span_size` bytes. `span_size` must be a power of two and `size`
    /// a multiple of it.
    pub fn new(coverage: Address, size: usize, span_size: usize) -> Self {
        assert!(span_size.is_power_of_two());
        assert!(size.is_multiple_of(span_size));
        let cards = (0..size / span_size)
            .map(|_| AtomicU8::new(CARD_CLEAN))
            .collect();
        Self {
            coverage,
            shift: span_size.trailing_zeros(),
            cards,
        }
    }

    #[inline(always)]
    pub fn index_of(&self, address: Address) -> usize {
        debug_assert!(address >= self.coverage);
        address.offset_from(self.coverage) >> self.shift
    }

    /// First heap address of card `index`.
    #[inline(always)]
    pub fn address_of(&self, index: usize) -> Address {
        self.coverage.plus(index << self.shift)
    }

    #[inline(always)]
    pub fn span_size(&self) -> usize {
        1 << self.shift
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    /// Barrier target. Unconditional store wins over load-test-store for
    /// this byte map.
    #[inline(always)]
    pub fn dirty(&self, address: Address) {
        self.cards[self.index_of(address)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// Index of the next dirty card in `[from, to)`, if any.
    pub fn next_dirty(&self, from: usize, to: usize) -> Option<usize> {
        (from..to.min(self.cards.len())).find(|&i| self.is_dirty(i))
    }

    pub fn clean(&self, index: usize) {
        self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
    }

    /// Cleans every card covering `[start, end)`.
    pub fn clean_range(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let first = self.index_of(start);
        let last = self.index_of(end.minus(1));
        for i in first..=last {
            self.clean(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirtying_marks_exactly_the_covering_card() {
        let base = Address::new(0x10_0000);
        let table = CardTable::new(base, 4096, 512);
        assert_eq!(table.card_count(), 8);

        table.dirty(base.plus(512 * 3 + 17));

        for i in 0..8 {
            assert_eq!(table.is_dirty(i), i == 3);
        }
    }

    #[test]
    fn index_and_address_are_inverse_on_span_starts() {
        let base = Address::new(0x20_0000);
        let table = CardTable::new(base, 8192, 512);
        for i in 0..table.card_count() {
            assert_eq!(table.index_of(table.address_of(i)), i);
        }
    }

    #[test]
    fn next_dirty_scans_forward() {
        let base = Address::new(0x30_0000);
        let table = CardTable::new(base, 4096, 512);
        table.dirty(base.plus(512 * 5));
        assert_eq!(table.next_dirty(0, 8), Some(5));
        assert_eq!(table.next_dirty(6, 8), None);
        table.clean(5);
        assert_eq!(table.next_dirty(0, 8), None);
    }

    #[test]
    fn clean_range_covers_partial_spans() {
        let base = Address::new(0x40_0000);
        let table = CardTable::new(base, 4096, 512);
        for i in 0..8 {
            table.dirty(base.plus(i * 512));
        }
        table.clean_range(base.plus(512), base.plus(512 * 3 + 1));
        assert!(table.is_dirty(0));
        assert!(!table.is_dirty(1));
        assert!(!table.is_dirty(2));
        assert!(!table.is_dirty(3));
        assert!(table.is_dirty(4));
    }
}
