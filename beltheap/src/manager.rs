//! Lays the configured belts out over the heap mapping and owns them.
//!
//! Belts are contiguous and ordered: belt `i + 1` starts exactly where
//! belt `i` ends, belt 0 is the youngest. Sizes come from the configured
//! percentages, rounded up to page granularity, with the last belt
//! absorbing the rounding slack up to the heap's logical end.

use log::debug;

use crate::address::Address;
use crate::belt::Belt;
use crate::system::round_to_page;

pub struct BeltManager {
    heap_start: Address,
    heap_end: Address,
    belts: Vec<Belt>,
}

impl BeltManager {
    pub fn new(heap_start: Address, heap_size: usize, percentages: &[u32]) -> Self {
        debug_assert!(percentages.len() >= 2);
        debug_assert!(percentages.iter().sum::<u32>() <= 100);
        let heap_end = heap_start.plus(heap_size);

        let mut belts = Vec::with_capacity(percentages.len());
        let mut cursor = heap_start;
        for (index, &percent) in percentages.iter().enumerate() {
            let end = if index == percentages.len() - 1 {
                heap_end
            } else {
                cursor.plus(round_to_page(heap_size * percent as usize / 100))
            };
            debug_assert!(end <= heap_end);
            debug!(
                "belt {index}: {cursor} - {end} ({} bytes)",
                end.offset_from(cursor)
            );
            belts.push(Belt::new(index, cursor, end));
            cursor = end;
        }

        Self {
            heap_start,
            heap_end,
            belts,
        }
    }

    pub fn belt_count(&self) -> usize {
        self.belts.len()
    }

    pub fn belt(&self, index: usize) -> &Belt {
        &self.belts[index]
    }

    pub fn belts(&self) -> &[Belt] {
        &self.belts
    }

    pub fn youngest(&self) -> &Belt {
        &self.belts[0]
    }

    pub fn eldest(&self) -> &Belt {
        &self.belts[self.belts.len() - 1]
    }

    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    pub fn heap_end(&self) -> Address {
        self.heap_end
    }

    /// The belt whose current bounds contain `address`, if any. Bounds
    /// move under swaps so this is a linear probe over the few belts.
    pub fn belt_containing(&self, address: Address) -> Option<&Belt> {
        self.belts.iter().find(|b| b.contains(address))
    }

    /// Exchanges the memory of two belts so that, for example, the belt
    /// that just absorbed a major evacuation becomes the eldest and the
    /// freshly reset eldest becomes the young allocation belt. Collector
    /// context only, mutators stopped.
    pub fn swap_belts(&self, from: usize, to: usize) {
        if from == to {
            return;
        }
        debug!("swapping belts {from} and {to}");
        self.belts[from].swap_with(&self.belts[to]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;

    fn manager(size: usize, percentages: &[u32]) -> BeltManager {
        let ptr = system::map_memory(size).expect("test mapping failed");
        BeltManager::new(Address::new(ptr.as_ptr() as usize), size, percentages)
    }

    #[test]
    fn belts_tile_the_heap_contiguously() {
        let m = manager(1 << 22, &[10, 20, 70]);
        assert_eq!(m.belt_count(), 3);
        assert_eq!(m.belt(0).start(), m.heap_start());
        assert_eq!(m.belt(0).end(), m.belt(1).start());
        assert_eq!(m.belt(1).end(), m.belt(2).start());
        assert_eq!(m.belt(2).end(), m.heap_end());
    }

    #[test]
    fn last_belt_absorbs_rounding_slack() {
        // 33/33 of 1 MiB rounds oddly; the last belt must still end at
        // the heap end.
        let m = manager(1 << 20, &[33, 33, 34]);
        let total: usize = m.belts().iter().map(|b| b.size()).sum();
        assert_eq!(total, 1 << 20);
        assert_eq!(m.eldest().end(), m.heap_end());
    }

    #[test]
    fn containing_belt_follows_swaps() {
        let m = manager(1 << 20, &[50, 50]);
        let in_first_half = m.heap_start().plus(64);
        assert_eq!(m.belt_containing(in_first_half).unwrap().index(), 0);

        m.swap_belts(0, 1);
        assert_eq!(m.belt_containing(in_first_half).unwrap().index(), 1);
        assert!(m.belt_containing(m.heap_end()).is_none());
    }
}
