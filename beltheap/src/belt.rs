//! A belt: one contiguous, ordered generation of the heap.
//!
//! Belts allocate by bumping a mark. There are several bump variants
//! because callers differ in who else might be bumping at the same time:
//! mutators contend on a compare-and-swap loop, sequential collector
//! phases own the belt outright, and evacuation additionally needs to
//! overflow into heap slack when the belt is expandable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::address::{Address, WORD_SIZE};
use crate::object::DEBUG_TAG;

/// Extra word reserved in front of directly-allocated cells in debug
/// builds, holding [`DEBUG_TAG`] for the verifier.
#[cfg(debug_assertions)]
pub const ALLOC_SKEW: usize = WORD_SIZE;
#[cfg(not(debug_assertions))]
pub const ALLOC_SKEW: usize = 0;

pub struct Belt {
    index: usize,
    /// Bounds are atomics because swap_belts rewrites them while proxies
    /// may still read them for containment checks.
    start: AtomicUsize,
    end: AtomicUsize,
    mark: AtomicUsize,
    /// Mark at the start of the current allocation burst; the region
    /// `[prev_mark, mark)` is what the last burst wrote.
    prev_mark: AtomicUsize,
    /// Hard limit an expandable belt may grow into (the heap's logical
    /// end). Equal to `end` for ordinary belts.
    ceiling: AtomicUsize,
    expandable: AtomicBool,
}

impl Belt {
    pub fn new(index: usize, start: Address, end: Address) -> Self {
        Self {
            index,
            start: AtomicUsize::new(start.raw()),
            end: AtomicUsize::new(end.raw()),
            mark: AtomicUsize::new(start.raw()),
            prev_mark: AtomicUsize::new(start.raw()),
            ceiling: AtomicUsize::new(end.raw()),
            expandable: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        Address::new(self.start.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        Address::new(self.end.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn mark(&self) -> Address {
        Address::new(self.mark.load(Ordering::Acquire))
    }

    pub fn prev_mark(&self) -> Address {
        Address::new(self.prev_mark.load(Ordering::Acquire))
    }

    pub fn size(&self) -> usize {
        self.end().offset_from(self.start())
    }

    pub fn used(&self) -> usize {
        self.mark().offset_from(self.start())
    }

    pub fn free(&self) -> usize {
        let view = self.view_remaining();
        // an expanded belt's mark may sit past its own end
        if view.is_empty() {
            0
        } else {
            view.end.offset_from(view.start)
        }
    }

    #[inline(always)]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start() && address < self.end()
    }

    pub fn is_expandable(&self) -> bool {
        self.expandable.load(Ordering::Acquire)
    }

    /// Lets GC allocation overflow past `end` up to `ceiling`. Only the
    /// belt receiving a major evacuation is expandable, and only for the
    /// duration of that evacuation.
    pub fn set_expandable(&self, expandable: bool, ceiling: Address) {
        self.ceiling.store(ceiling.raw(), Ordering::Release);
        self.expandable.store(expandable, Ordering::Release);
    }

    /// Records the current mark as the base of the next allocation burst.
    pub fn begin_burst(&self) {
        self.prev_mark
            .store(self.mark.load(Ordering::Acquire), Ordering::Release);
    }

    /// Empties the belt.
    pub fn reset(&self) {
        let start = self.start.load(Ordering::Acquire);
        self.mark.store(start, Ordering::Release);
        self.prev_mark.store(start, Ordering::Release);
    }

    /// Exchanges the bounds and marks of two belts. Caller must be the
    /// sole collector thread with all mutators stopped.
    pub fn swap_with(&self, other: &Belt) {
        fn swap(a: &AtomicUsize, b: &AtomicUsize) {
            let va = a.load(Ordering::Acquire);
            let vb = b.load(Ordering::Acquire);
            a.store(vb, Ordering::Release);
            b.store(va, Ordering::Release);
        }
        swap(&self.start, &other.start);
        swap(&self.end, &other.end);
        swap(&self.mark, &other.mark);
        swap(&self.prev_mark, &other.prev_mark);
        swap(&self.ceiling, &other.ceiling);
    }

    /// Synchronized bump allocation for ordinary requests. The cell is
    /// skewed by one tag word in debug builds. Returns zero on
    /// exhaustion; the heap scheme decides whether a collection can
    /// recover the request.
    #[inline]
    pub fn allocate(&self, size: usize) -> Address {
        loop {
            let old = self.mark.load(Ordering::Acquire);
            let cell = old + ALLOC_SKEW;
            let new = cell + size;
            if new > self.end.load(Ordering::Acquire) {
                return Address::zero();
            }
            if self
                .mark
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                #[cfg(debug_assertions)]
                // SAFETY: [old, new) was just reserved by the winning CAS
                unsafe {
                    Address::new(old).write_word(DEBUG_TAG);
                }
                return Address::new(cell);
            }
        }
    }

    /// Synchronized bump allocation without the debug-tag skew, for
    /// carving out whole buffers rather than single cells.
    #[inline]
    pub fn allocate_tlab(&self, size: usize) -> Address {
        loop {
            let old = self.mark.load(Ordering::Acquire);
            let new = old + size;
            if new > self.end.load(Ordering::Acquire) {
                return Address::zero();
            }
            if self
                .mark
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Address::new(old);
            }
        }
    }

    /// Unsynchronized bump for single-threaded collector phases. Returns
    /// zero on exhaustion, the caller handles it.
    #[inline]
    pub fn bump_allocate(&self, size: usize) -> Address {
        let old = self.mark.load(Ordering::Acquire);
        let new = old + size;
        let limit = if self.is_expandable() {
            self.ceiling.load(Ordering::Acquire)
        } else {
            self.end.load(Ordering::Acquire)
        };
        if new > limit {
            return Address::zero();
        }
        self.mark.store(new, Ordering::Release);
        Address::new(old)
    }

    /// Synchronized bump for parallel evacuation. Checks the belt's own
    /// `end` first and falls through to `ceiling` when expandable.
    /// Returns zero when even the ceiling cannot satisfy the request.
    #[inline]
    pub fn gc_allocate(&self, size: usize) -> Address {
        loop {
            let old = self.mark.load(Ordering::Acquire);
            let new = old + size;
            if new > self.end.load(Ordering::Acquire) {
                if !self.is_expandable() || new > self.ceiling.load(Ordering::Acquire)
                {
                    return Address::zero();
                }
            }
            if self
                .mark
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Address::new(old);
            }
        }
    }

    /// Unsynchronized bump for a sequential evacuation that owns the
    /// belt. Going over the end without expandability is a collector bug,
    /// not a recoverable condition.
    #[inline]
    pub fn gc_bump_allocate(&self, size: usize) -> Address {
        let old = self.mark.load(Ordering::Acquire);
        let new = old + size;
        if new > self.end.load(Ordering::Acquire) {
            assert!(
                self.is_expandable() && new <= self.ceiling.load(Ordering::Acquire),
                "belt {} exhausted during collection",
                self.index
            );
        }
        self.mark.store(new, Ordering::Release);
        Address::new(old)
    }

    /// Like [`Belt::gc_allocate`] but the returned cell is aligned to
    /// `align`. The skipped gap, if any, is returned as `(gap_start, cell)`
    /// so the caller can fill it with a parseable dead cell.
    pub fn gc_allocate_aligned(
        &self,
        size: usize,
        align: usize,
    ) -> Option<(Address, Address)> {
        loop {
            let old = self.mark.load(Ordering::Acquire);
            let cell = Address::new(old).align_up(align);
            let new = cell.raw() + size;
            if new > self.end.load(Ordering::Acquire) {
                if !self.is_expandable() || new > self.ceiling.load(Ordering::Acquire)
                {
                    return None;
                }
            }
            if self
                .mark
                .compare_exchange_weak(
                    old,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some((Address::new(old), cell));
            }
        }
    }

    /// Advances the mark to the next `align` boundary, returning the
    /// skipped `(gap_start, new_mark)` for the caller to fill. Belt ends
    /// are page aligned, so the aligned mark never passes the end.
    pub fn align_mark(&self, align: usize) -> (Address, Address) {
        loop {
            let old = self.mark.load(Ordering::Acquire);
            let new = Address::new(old).align_up(align);
            debug_assert!(new.raw() <= self.ceiling.load(Ordering::Acquire));
            if self
                .mark
                .compare_exchange_weak(
                    old,
                    new.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return (Address::new(old), new);
            }
        }
    }

    /// Pulls the mark back to `cell` if nothing allocated after it. Lets
    /// the evacuator retract a copy it lost the forwarding race for when
    /// the copy is still the topmost allocation.
    pub fn retract_if_top(&self, cell: Address, size: usize) -> bool {
        self.mark
            .compare_exchange(
                cell.raw() + size,
                cell.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A read-only window over part of a belt, used to treat the region
/// written by the most recent allocation burst as a scan source of its
/// own.
#[derive(Clone, Copy, Debug)]
pub struct BeltView {
    pub start: Address,
    pub end: Address,
}

impl BeltView {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }
}

impl Belt {
    /// The region written since [`Belt::begin_burst`].
    pub fn view_since_burst(&self) -> BeltView {
        BeltView {
            start: self.prev_mark(),
            end: self.mark(),
        }
    }

    /// The whole allocated region.
    pub fn view_allocated(&self) -> BeltView {
        BeltView {
            start: self.start(),
            end: self.mark(),
        }
    }

    /// The unallocated region between the mark and the belt end. Empty
    /// when an expanded belt's mark moved past its own end.
    pub fn view_remaining(&self) -> BeltView {
        BeltView {
            start: self.mark(),
            end: self.end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;
    use std::sync::Arc;

    fn mapped(size: usize) -> Address {
        let ptr = system::map_memory(size).expect("test mapping failed");
        Address::new(ptr.as_ptr() as usize)
    }

    fn mapped_belt(size: usize) -> (Address, Belt) {
        let start = mapped(size);
        (start, Belt::new(0, start, start.plus(size)))
    }

    #[test]
    fn bump_allocate_returns_zero_on_exhaustion() {
        let (_start, belt) = mapped_belt(4096);
        let a = belt.bump_allocate(2048);
        let b = belt.bump_allocate(2048);
        let c = belt.bump_allocate(16);
        assert!(!a.is_zero());
        assert_eq!(b, a.plus(2048));
        assert!(c.is_zero());
    }

    #[test]
    fn gc_allocate_overflows_only_when_expandable() {
        let start = mapped(8192);
        // belt owns the lower half, the upper half is heap slack
        let belt = Belt::new(0, start, start.plus(4096));

        assert!(belt.gc_allocate(6000).is_zero());

        belt.set_expandable(true, start.plus(8192));
        let cell = belt.gc_allocate(6000);
        assert_eq!(cell, start);
        assert!(belt.gc_allocate(4096).is_zero());
    }

    #[test]
    #[should_panic(expected = "exhausted during collection")]
    fn gc_bump_panics_past_end_without_expandability() {
        let (_start, belt) = mapped_belt(4096);
        belt.gc_bump_allocate(4096);
        belt.gc_bump_allocate(16);
    }

    #[test]
    fn swap_exchanges_bounds_and_marks() {
        let (start, _both) = mapped_belt(8192);
        let a = Belt::new(0, start, start.plus(4096));
        let b = Belt::new(1, start.plus(4096), start.plus(8192));
        a.bump_allocate(128);
        b.bump_allocate(512);

        a.swap_with(&b);

        assert_eq!(a.start(), start.plus(4096));
        assert_eq!(a.used(), 512);
        assert_eq!(b.start(), start);
        assert_eq!(b.used(), 128);

        a.swap_with(&b);
        assert_eq!(a.start(), start);
        assert_eq!(a.used(), 128);
    }

    #[test]
    fn views_split_the_belt_at_its_marks() {
        let (start, belt) = mapped_belt(4096);
        assert!(belt.view_since_burst().is_empty());

        belt.bump_allocate(256);
        belt.begin_burst();
        belt.bump_allocate(512);

        let burst = belt.view_since_burst();
        assert_eq!(burst.start, start.plus(256));
        assert_eq!(burst.end, start.plus(768));
        assert!(burst.contains(start.plus(256)));
        assert!(!burst.contains(start.plus(768)));

        let rest = belt.view_remaining();
        assert_eq!(rest.start, start.plus(768));
        assert_eq!(rest.end, belt.end());
        assert_eq!(belt.free(), 4096 - 768);

        belt.bump_allocate(4096 - 768);
        assert!(belt.view_remaining().is_empty());
        assert_eq!(belt.free(), 0);
    }

    #[test]
    fn retract_succeeds_only_on_top() {
        let (_start, belt) = mapped_belt(4096);
        let a = belt.bump_allocate(64);
        let b = belt.bump_allocate(64);
        assert!(!belt.retract_if_top(a, 64));
        assert!(belt.retract_if_top(b, 64));
        assert_eq!(belt.mark(), b);
    }

    #[test]
    fn concurrent_tlab_carves_are_disjoint() {
        let (_start, belt) = mapped_belt(1 << 20);
        let belt = Arc::new(belt);
        let per_thread = 64;
        let chunk = 512;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let belt = belt.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::with_capacity(per_thread);
                    for _ in 0..per_thread {
                        let cell = belt.allocate_tlab(chunk);
                        assert!(!cell.is_zero());
                        mine.push(cell);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<Address> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        for pair in all.windows(2) {
            assert!(pair[1].offset_from(pair[0]) >= chunk);
        }
        assert_eq!(belt.used(), 8 * per_thread * chunk);
    }
}
