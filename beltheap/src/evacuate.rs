//! The evacuation action: relocate one reference from the from-belt into
//! to-space, installing and honoring forwarding.
//!
//! The action is the single primitive both scan phases are built from. A
//! root scan applies it to every root slot; a follower scan applies it to
//! every reference slot of every freshly copied cell, which keeps
//! producing work until the to-space frontier catches its allocation
//! mark.

use log::error;

use crate::address::{Address, WORD_SIZE};
use crate::belt::{Belt, BeltView};
use crate::object::{DEBUG_TAG, Header, ObjectModel, copy_cell};

/// Where an evacuator gets memory for copies. The sequential collector
/// bumps the target belt directly; parallel workers go through a
/// per-worker buffer so copies do not contend on the belt mark.
pub trait GcAllocator {
    /// Reserves `size` bytes of to-space. Zero means to-space is
    /// exhausted, which is fatal for the cycle.
    fn alloc_copy(&mut self, size: usize) -> Address;

    /// Best-effort release of a copy that lost the forwarding race.
    /// Returning false leaves the copy behind as parseable garbage,
    /// which later walks tolerate.
    fn retract(&mut self, cell: Address, size: usize) -> bool {
        let _ = (cell, size);
        false
    }
}

/// Sequential allocator: sole owner of the target belt.
pub struct BeltBumpAllocator<'a> {
    to: &'a Belt,
}

impl<'a> BeltBumpAllocator<'a> {
    pub fn new(to: &'a Belt) -> Self {
        Self { to }
    }
}

impl GcAllocator for BeltBumpAllocator<'_> {
    fn alloc_copy(&mut self, size: usize) -> Address {
        self.to.gc_bump_allocate(size)
    }
}

/// One collection's evacuator state, parameterized by the to-space
/// allocation strategy.
pub struct Evacuator<A: GcAllocator> {
    from_start: Address,
    from_end: Address,
    allocator: A,
    model: ObjectModel,
    /// When several threads evacuate concurrently, forwarding must be
    /// claimed by compare-and-swap instead of plain store.
    parallel: bool,
    pub copied_cells: usize,
    pub copied_bytes: usize,
}

impl<A: GcAllocator> Evacuator<A> {
    pub fn new(from: &Belt, allocator: A, model: ObjectModel, parallel: bool) -> Self {
        Self {
            from_start: from.start(),
            from_end: from.mark(),
            allocator,
            model,
            parallel,
            copied_cells: 0,
            copied_bytes: 0,
        }
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn into_allocator(self) -> A {
        self.allocator
    }

    /// Applies the evacuation action to one reference slot, rewriting it
    /// in place if the target moves.
    ///
    /// # Safety
    /// The slot must hold either zero or a reference to a live cell, and
    /// all mutators must be stopped.
    #[inline]
    pub unsafe fn evacuate_slot(&mut self, slot: &mut Address) {
        let reference = *slot;
        if reference < self.from_start || reference >= self.from_end {
            return;
        }
        // SAFETY: in-belt references point at live cells per contract
        *slot = unsafe { self.evacuate_reference(reference) };
    }

    /// # Safety
    /// `reference` must point at a live cell inside the from-belt.
    unsafe fn evacuate_reference(&mut self, reference: Address) -> Address {
        // SAFETY: live cell per contract
        let header = unsafe { Header::at(reference) };

        let forwarded = header.forwarding();
        if !forwarded.is_zero() {
            return forwarded;
        }

        // SAFETY: live cell per contract
        let size = unsafe { (self.model.size_of)(reference) };
        let copy = self.allocator.alloc_copy(size);
        if copy.is_zero() {
            error!(
                "to-space exhausted copying {size} byte cell at {reference} \
                 (from-belt {} - {})",
                self.from_start, self.from_end
            );
            panic!("out of memory during collection");
        }
        // SAFETY: copy was just reserved, the original is frozen
        unsafe { copy_cell(reference, copy, size) };

        if self.parallel {
            match header.claim_forwarding(copy) {
                Ok(()) => {
                    self.copied_cells += 1;
                    self.copied_bytes += size;
                    copy
                }
                Err(winner) => {
                    // lost the race; drop the duplicate if it is still
                    // the topmost allocation, else leave it parseable
                    let _ = self.allocator.retract(copy, size);
                    winner
                }
            }
        } else {
            header.set_forwarding(copy);
            self.copied_cells += 1;
            self.copied_bytes += size;
            copy
        }
    }

    /// Evacuates every reference held by the cell at `cell`.
    ///
    /// # Safety
    /// `cell` must point at a live cell of the configured model.
    #[inline]
    pub unsafe fn trace_cell(&mut self, cell: Address) {
        let trace = self.model.trace;
        // the borrow checker cannot see through the fn pointer, so hand
        // the visitor a raw pointer to self
        let this: *mut Self = self;
        // SAFETY: live cell per contract; `this` outlives the call
        unsafe {
            trace(cell, &mut |slot| (*this).evacuate_slot(slot));
        }
    }
}

/// Advances `cursor` past a debug tag word if one is planted there.
#[inline(always)]
fn skip_debug_tag(cursor: Address, end: Address) -> Address {
    if cfg!(debug_assertions)
        && cursor.plus(WORD_SIZE) <= end
        // SAFETY: cursor is inside the allocated part of a belt
        && unsafe { cursor.read_word() } == DEBUG_TAG
    {
        cursor.plus(WORD_SIZE)
    } else {
        cursor
    }
}

/// Linearly visits every cell in `[view.start, view.end)`, skipping
/// debug tags and filler cells.
///
/// # Safety
/// The view must cover a parseable run of cells.
pub unsafe fn walk_cells(
    view: BeltView,
    model: &ObjectModel,
    visit: &mut dyn FnMut(Address),
) {
    let mut cursor = view.start;
    while cursor < view.end {
        cursor = skip_debug_tag(cursor, view.end);
        if cursor >= view.end {
            break;
        }
        // SAFETY: parseable run per contract
        let header = unsafe { Header::at(cursor) };
        let size = if header.is_filler() {
            header.size()
        } else {
            visit(cursor);
            // SAFETY: live cell
            unsafe { (model.size_of)(cursor) }
        };
        debug_assert!(size >= WORD_SIZE);
        cursor = cursor.plus(size);
    }
}

/// Frontier-chasing walk of a belt from `from` to the belt's moving
/// allocation mark. Visiting a cell may evacuate more cells into the
/// same belt, so the mark is re-read every step. Returns the address the
/// frontier reached.
///
/// # Safety
/// `[from, belt.mark())` must be a parseable run of cells at every step.
pub unsafe fn walk_followers(
    belt: &Belt,
    from: Address,
    model: &ObjectModel,
    visit: &mut dyn FnMut(Address),
) -> Address {
    let mut cursor = from;
    while cursor < belt.mark() {
        cursor = skip_debug_tag(cursor, belt.mark());
        if cursor >= belt.mark() {
            break;
        }
        // SAFETY: parseable run per contract
        let header = unsafe { Header::at(cursor) };
        if header.is_filler() {
            cursor = cursor.plus(header.size());
            continue;
        }
        visit(cursor);
        // SAFETY: live cell
        let size = unsafe { (model.size_of)(cursor) };
        cursor = cursor.plus(size);
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;
    use crate::testlayout;

    fn mapped(size: usize) -> Address {
        let ptr = system::map_memory(size).expect("test mapping failed");
        Address::new(ptr.as_ptr() as usize)
    }

    fn two_belts() -> (Belt, Belt) {
        let base = mapped(64 * 1024);
        let from = Belt::new(0, base, base.plus(32 * 1024));
        let to = Belt::new(1, base.plus(32 * 1024), base.plus(64 * 1024));
        (from, to)
    }

    #[test]
    fn references_outside_from_are_untouched() {
        let (from, to) = two_belts();
        let elsewhere = Address::new(0xDEAD_0000);
        let mut slot = elsewhere;
        let mut evac = Evacuator::new(
            &from,
            BeltBumpAllocator::new(&to),
            testlayout::model(),
            false,
        );
        // SAFETY: slot target is outside the from-belt, never dereferenced
        unsafe { evac.evacuate_slot(&mut slot) };
        assert_eq!(slot, elsewhere);
        assert_eq!(evac.copied_cells, 0);
    }

    #[test]
    fn evacuation_copies_once_and_forwards() {
        let (from, to) = two_belts();
        let size = testlayout::cell_size(0, 4);
        let cell = from.bump_allocate(size);
        testlayout::write_cell(cell, size, &[]);

        let mut evac = Evacuator::new(
            &from,
            BeltBumpAllocator::new(&to),
            testlayout::model(),
            false,
        );
        let mut a = cell;
        let mut b = cell;
        // SAFETY: both slots point at the live test cell
        unsafe {
            evac.evacuate_slot(&mut a);
            evac.evacuate_slot(&mut b);
        }
        assert!(to.contains(a));
        assert_eq!(a, b);
        assert_eq!(evac.copied_cells, 1);
        assert_eq!(to.used(), size);
        // SAFETY: copied cell is live in to-space
        assert_eq!(unsafe { Header::at(a) }.size(), size);
        assert!(unsafe { Header::at(a) }.forwarding().is_zero());
    }

    #[test]
    fn follower_walk_drains_a_chain() {
        let (from, to) = two_belts();
        let model = testlayout::model();
        let size = testlayout::cell_size(1, 2);

        // chain of 20 cells, each pointing at the next
        let mut cells = Vec::new();
        for _ in 0..20 {
            let cell = from.bump_allocate(size);
            cells.push(cell);
        }
        for (i, &cell) in cells.iter().enumerate() {
            let next = cells.get(i + 1).copied().unwrap_or(Address::zero());
            testlayout::write_cell(cell, size, &[next]);
        }

        let mut evac =
            Evacuator::new(&from, BeltBumpAllocator::new(&to), model, false);
        let scan_base = to.mark();
        let mut head = cells[0];
        // SAFETY: head is a live test cell
        unsafe { evac.evacuate_slot(&mut head) };

        // SAFETY: to-space holds only freshly copied test cells
        let frontier = unsafe {
            walk_followers(&to, scan_base, &model, &mut |cell| {
                evac.trace_cell(cell);
            })
        };
        assert_eq!(frontier, to.mark());
        assert_eq!(evac.copied_cells, 20);

        // the copied chain must be intact and fully inside to-space
        let mut cursor = head;
        let mut seen = 0;
        while !cursor.is_zero() {
            assert!(to.contains(cursor));
            cursor = testlayout::get_ref(cursor, 0);
            seen += 1;
        }
        assert_eq!(seen, 20);
    }

    #[test]
    fn walk_skips_fillers() {
        let base = mapped(4096);
        let size = testlayout::cell_size(0, 1);
        let a = base;
        let filler = base.plus(size);
        let b = filler.plus(64);
        testlayout::write_cell(a, size, &[]);
        // SAFETY: test memory, exclusively owned
        unsafe { Header::install_filler(filler, 64) };
        testlayout::write_cell(b, size, &[]);

        let mut visited = Vec::new();
        let view = BeltView {
            start: base,
            end: b.plus(size),
        };
        // SAFETY: the region above is parseable
        unsafe {
            walk_cells(view, &testlayout::model(), &mut |cell| visited.push(cell))
        };
        assert_eq!(visited, vec![a, b]);
    }

    #[test]
    fn racing_evacuators_agree_on_one_copy() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let base = mapped(256 * 1024);
        let from = Arc::new(Belt::new(0, base, base.plus(128 * 1024)));
        let to = Arc::new(Belt::new(1, base.plus(128 * 1024), base.plus(256 * 1024)));

        let size = testlayout::cell_size(0, 2);
        let count = 200;
        let mut cells = Vec::new();
        for _ in 0..count {
            let cell = from.bump_allocate(size);
            testlayout::write_cell(cell, size, &[]);
            cells.push(cell.raw());
        }
        let cells = Arc::new(cells);
        let total_copies = Arc::new(AtomicUsize::new(0));

        struct SharedBeltAllocator(Arc<Belt>);
        impl GcAllocator for SharedBeltAllocator {
            fn alloc_copy(&mut self, size: usize) -> Address {
                self.0.gc_allocate(size)
            }
            fn retract(&mut self, cell: Address, size: usize) -> bool {
                self.0.retract_if_top(cell, size)
            }
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let from = from.clone();
                let to = to.clone();
                let cells = cells.clone();
                let total_copies = total_copies.clone();
                std::thread::spawn(move || {
                    let mut evac = Evacuator::new(
                        &from,
                        SharedBeltAllocator(to),
                        testlayout::model(),
                        true,
                    );
                    let mut forwarded = Vec::with_capacity(cells.len());
                    for &raw in cells.iter() {
                        let mut slot = Address::new(raw);
                        // SAFETY: slot points at a live test cell
                        unsafe { evac.evacuate_slot(&mut slot) };
                        forwarded.push(slot);
                    }
                    total_copies.fetch_add(evac.copied_cells, Ordering::SeqCst);
                    forwarded
                })
            })
            .collect();

        let results: Vec<Vec<Address>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // every thread must observe the same forwarding per cell
        for i in 0..count {
            let first = results[0][i];
            assert!(to.contains(first));
            for r in &results {
                assert_eq!(r[i], first);
            }
        }
        // each cell was copied (won) exactly once
        assert_eq!(total_copies.load(Ordering::SeqCst), count);
    }
}
