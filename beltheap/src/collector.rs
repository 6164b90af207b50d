//! Stop-the-world collection cycles.
//!
//! A cycle promotes the young belt into its elder, then relieves elder
//! belts bottom-up while pressure remains, and finally compacts the
//! eldest belt when it runs short of headroom. Each promotion is a
//! three-phase scan: strong roots (parked mutator stacks, the
//! coordinator's own roots, global roots), dirty cards of the remaining
//! belts, then the followers in to-space until the frontier catches the
//! allocation mark.
//!
//! In parallel mode the follower phase runs on scoped worker threads.
//! Workers share work through the side table: the coordinator publishes
//! the blocks it filled during root and card scanning as claimable
//! `START` blocks, and each worker drains the copies it makes itself
//! from its own buffers. A worker terminates when it can neither claim a
//! block nor find an unscanned copy of its own; since every copy lands
//! in the buffer of the thread that made it, no new work can reach an
//! exhausted worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use log::{debug, error, info};

use crate::address::Address;
use crate::belt::{Belt, BeltView};
use crate::evacuate::{
    BeltBumpAllocator, Evacuator, GcAllocator, walk_cells, walk_followers,
};
use crate::heap::{GcHook, GcStats, HeapInner};
use crate::object::{Header, RootProvider};
use crate::safepoint::FrozenThreads;
use crate::side::{CHUNK_MIDDLE, CHUNK_SCAVENGED, CHUNK_START};
use crate::verify;

#[derive(Default, Clone, Copy)]
struct Promotion {
    cells: usize,
    bytes: usize,
}

impl std::ops::AddAssign for Promotion {
    fn add_assign(&mut self, other: Self) {
        self.cells += other.cells;
        self.bytes += other.bytes;
    }
}

/// Freezes the world and runs one full cycle. Called by the mutator that
/// claimed coordination; its own roots are passed directly since it
/// never parks.
pub(crate) fn collect(heap: &HeapInner, coordinator: usize, roots: &mut dyn RootProvider) {
    heap.registry
        .freeze(coordinator, |frozen| run_cycle(heap, frozen, roots));
}

fn run_cycle(heap: &HeapInner, frozen: &FrozenThreads, coord_roots: &mut dyn RootProvider) {
    let started = Instant::now();
    heap.epoch.fetch_add(1, Ordering::Release);

    let before = heap.stats.lock().clone();
    run_hooks(&heap.pre_gc_hooks, &before);
    if heap.settings.verify {
        verify::verify_heap(heap);
    }
    info!(
        "collection {}: starting, {} bytes free",
        before.collections + 1,
        heap.report_free_space()
    );

    let n = heap.manager.belt_count();
    let mut total = Promotion::default();
    let mut ran_major = false;

    total += promote(heap, frozen, coord_roots, 0, 1);
    reset_belt(heap, 0);

    // relieve elder belts while the one below could overflow them
    let mut cascaded = true;
    for i in 1..n - 1 {
        if heap.manager.belt(i).free() < heap.manager.belt(i - 1).size() {
            total += promote(heap, frozen, coord_roots, i, i + 1);
            reset_belt(heap, i);
        } else {
            cascaded = false;
            break;
        }
    }
    if cascaded && heap.manager.eldest().free() < heap.manager.belt(n - 2).size() {
        total += major(heap, frozen, coord_roots);
        ran_major = true;
    }

    if heap.settings.verify {
        verify::verify_heap(heap);
    }

    let pause = started.elapsed();
    let after = {
        let mut stats = heap.stats.lock();
        stats.collections += 1;
        if ran_major {
            stats.major_collections += 1;
        }
        stats.copied_cells += total.cells;
        stats.copied_bytes += total.bytes;
        stats.last_pause = pause;
        stats.total_pause += pause;
        stats.clone()
    };
    run_hooks(&heap.post_gc_hooks, &after);
    info!(
        "collection {}: promoted {} cells ({} bytes) in {:.2?}, {} bytes free",
        after.collections,
        total.cells,
        total.bytes,
        pause,
        heap.report_free_space()
    );
}

fn run_hooks(hooks: &parking_lot::Mutex<Vec<GcHook>>, stats: &GcStats) {
    for hook in hooks.lock().iter() {
        hook(stats);
    }
}

/// Compacts the eldest belt: evacuate it into the (empty) young belt,
/// which may expand over the other empty belts, then copy the compacted
/// survivors back. All belts but the eldest must be empty on entry.
fn major(heap: &HeapInner, frozen: &FrozenThreads, coord_roots: &mut dyn RootProvider) -> Promotion {
    let n = heap.manager.belt_count();
    let eldest = heap.manager.eldest();
    let scratch = heap.manager.youngest();
    debug_assert!((0..n - 1).all(|i| heap.manager.belt(i).used() == 0));
    info!(
        "major collection: compacting belt {} ({} bytes used)",
        eldest.index(),
        eldest.used()
    );

    scratch.set_expandable(true, eldest.start());
    let mut total = promote(heap, frozen, coord_roots, n - 1, 0);
    reset_belt(heap, n - 1);

    if scratch.used() > eldest.size() {
        error!(
            "{} bytes survive major collection, eldest belt holds {}",
            scratch.used(),
            eldest.size()
        );
        heap.print_diagnostics();
        panic!("out of memory during major collection");
    }

    total += promote(heap, frozen, coord_roots, 0, n - 1);
    reset_belt(heap, 0);
    scratch.set_expandable(false, scratch.end());
    total
}

fn reset_belt(heap: &HeapInner, index: usize) {
    let belt = heap.manager.belt(index);
    heap.side.reset_range(belt.start(), belt.mark());
    heap.cards.clean_range(belt.start(), belt.mark());
    belt.reset();
}

fn promote(
    heap: &HeapInner,
    frozen: &FrozenThreads,
    coord_roots: &mut dyn RootProvider,
    from_idx: usize,
    to_idx: usize,
) -> Promotion {
    let from = heap.manager.belt(from_idx);
    let to = heap.manager.belt(to_idx);
    if from.used() == 0 {
        return Promotion::default();
    }
    debug!(
        "promote: belt {from_idx} ({} bytes used) into belt {to_idx} ({} bytes free)",
        from.used(),
        to.free()
    );

    // start the copied region on a chunk boundary so side-table blocks
    // of this promotion never share a chunk with older blocks
    let (gap, aligned) = to.align_mark(heap.settings.span_size);
    if aligned > gap {
        // SAFETY: [gap, aligned) was just reserved off the belt mark
        unsafe { Header::install_filler(gap, aligned.offset_from(gap)) };
    }
    to.begin_burst();

    let result = if heap.settings.parallel {
        promote_parallel(heap, frozen, coord_roots, from, to)
    } else {
        promote_sequential(heap, frozen, coord_roots, from, to)
    };

    // surviving blocks become claimable again next cycle
    heap.side
        .restore_scavenged_range(heap.heap_start(), heap.heap_end());
    result
}

fn promote_sequential(
    heap: &HeapInner,
    frozen: &FrozenThreads,
    coord_roots: &mut dyn RootProvider,
    from: &Belt,
    to: &Belt,
) -> Promotion {
    let mut evac = Evacuator::new(from, BeltBumpAllocator::new(to), heap.model, false);

    scan_strong_roots(heap, frozen, coord_roots, &mut evac);
    scan_dirty_cards(heap, from.index(), to.index(), &mut evac);
    let burst = to.view_since_burst().start;
    // SAFETY: to-space past the burst mark holds only cells this
    // promotion copied, all frozen
    unsafe {
        walk_followers(to, burst, &heap.model, &mut |cell| {
            evac.trace_cell(cell)
        });
    }

    // one parseable block per sequential promotion
    if to.mark() > burst {
        heap.side.mark_block(burst, to.mark());
    }
    Promotion {
        cells: evac.copied_cells,
        bytes: evac.copied_bytes,
    }
}

fn promote_parallel(
    heap: &HeapInner,
    frozen: &FrozenThreads,
    coord_roots: &mut dyn RootProvider,
    from: &Belt,
    to: &Belt,
) -> Promotion {
    // the coordinator runs roots and cards alone, then hands its filled
    // buffers to the workers as claimable scan work
    let mut evac = Evacuator::new(from, GcTlab::new(heap, to), heap.model, true);
    scan_strong_roots(heap, frozen, coord_roots, &mut evac);
    scan_dirty_cards(heap, from.index(), to.index(), &mut evac);

    let cells = AtomicUsize::new(evac.copied_cells);
    let bytes = AtomicUsize::new(evac.copied_bytes);
    evac.into_allocator().publish_claimable();

    let burst = to.view_since_burst().start;
    let workers = heap.settings.gc_threads;
    std::thread::scope(|scope| {
        for w in 0..workers {
            let cells = &cells;
            let bytes = &bytes;
            std::thread::Builder::new()
                .name(format!("gc-worker-{w}"))
                .spawn_scoped(scope, move || {
                    scavenge_worker(heap, from, to, burst, cells, bytes)
                })
                .expect("failed to spawn gc worker");
        }
    });

    Promotion {
        cells: cells.load(Ordering::Acquire),
        bytes: bytes.load(Ordering::Acquire),
    }
}

/// One parallel follower-scan worker. Alternates between claiming
/// published blocks and draining its own copies until neither yields
/// work.
fn scavenge_worker(
    heap: &HeapInner,
    from: &Belt,
    to: &Belt,
    burst: Address,
    cells: &AtomicUsize,
    bytes: &AtomicUsize,
) {
    let span = heap.settings.span_size;
    let search_base = heap.side.index_of(burst);
    let mut evac = Evacuator::new(from, GcTlab::new(heap, to), heap.model, true);

    loop {
        let mut progress = false;

        loop {
            let stop = heap.side.index_of(to.mark().align_up(span));
            let Some(index) = heap.side.claim_next(search_base, stop) else {
                break;
            };
            let end = heap.side.block_end_index(index, stop);
            let view = BeltView {
                start: heap.side.address_of(index),
                end: heap.side.address_of(end),
            };
            // SAFETY: a claimed block is a retired, tail-filled buffer
            unsafe {
                walk_cells(view, &heap.model, &mut |cell| evac.trace_cell(cell));
            }
            progress = true;
        }

        while let Some(view) = evac.allocator_mut().next_unscanned() {
            // SAFETY: the view covers complete copies made by this thread
            unsafe {
                walk_cells(view, &heap.model, &mut |cell| evac.trace_cell(cell));
            }
            progress = true;
        }

        if !progress {
            break;
        }
    }

    cells.fetch_add(evac.copied_cells, Ordering::AcqRel);
    bytes.fetch_add(evac.copied_bytes, Ordering::AcqRel);
    evac.into_allocator().finish();
}

fn scan_strong_roots<A: GcAllocator>(
    heap: &HeapInner,
    frozen: &FrozenThreads,
    coord_roots: &mut dyn RootProvider,
    evac: &mut Evacuator<A>,
) {
    // SAFETY: root slots hold zero or live references and the world is
    // frozen for all three sources
    frozen.visit_roots(&mut |slot| unsafe { evac.evacuate_slot(slot) });
    coord_roots.visit_roots(&mut |slot| unsafe { evac.evacuate_slot(slot) });
    for slot in heap.global_roots.lock().iter_mut() {
        unsafe { evac.evacuate_slot(slot) };
    }
}

/// Walks the blocks covered by dirty cards of every belt other than the
/// from-belt, evacuating the young references they hold. Blocks are
/// claimed through the side table so each is walked once no matter how
/// many of its cards are dirty. Cards stay dirty; the table is
/// conservative and cleared only when its belt resets.
fn scan_dirty_cards<A: GcAllocator>(
    heap: &HeapInner,
    from_idx: usize,
    to_idx: usize,
    evac: &mut Evacuator<A>,
) {
    for belt in heap.manager.belts() {
        if belt.index() == from_idx || belt.used() == 0 {
            continue;
        }
        // the to-belt's burst region is covered by the follower scan
        let limit = if belt.index() == to_idx {
            belt.prev_mark()
        } else {
            belt.mark()
        };
        if limit <= belt.start() {
            continue;
        }

        let first = heap.cards.index_of(belt.start());
        let last = heap.cards.index_of(limit.minus(1));
        let mut cursor = first;
        while let Some(card) = heap.cards.next_dirty(cursor, last + 1) {
            cursor = card + 1;
            let block = heap
                .side
                .block_start_for(heap.cards.address_of(card), belt.start());
            if block.is_zero() {
                continue;
            }
            let start_index = heap.side.index_of(block);
            if heap.side.compare_and_swap_start(start_index) != CHUNK_START {
                continue;
            }
            let stop = heap.side.index_of(limit.minus(1)) + 1;
            let end_index = heap.side.block_end_index(start_index, stop);
            let view = BeltView {
                start: block,
                end: heap.side.address_of(end_index).min(limit),
            };
            // SAFETY: blocks are parseable runs and cells never straddle
            // the allocation mark
            unsafe {
                walk_cells(view, &heap.model, &mut |cell| evac.trace_cell(cell));
            }
        }
    }
}

/// A collector thread's private to-space buffer.
///
/// The current buffer is marked CREATING in the side table so no other
/// thread claims it while cells are still being copied in. Full buffers
/// are sealed: tail filled, block published as SCAVENGED (private), and
/// kept on a pending list until this thread has scanned everything it
/// copied into them.
struct GcBuffer {
    start: Address,
    scanned: Address,
    top: Address,
    end: Address,
}

impl GcBuffer {
    fn unset() -> Self {
        Self {
            start: Address::zero(),
            scanned: Address::zero(),
            top: Address::zero(),
            end: Address::zero(),
        }
    }

    fn is_set(&self) -> bool {
        !self.start.is_zero()
    }
}

pub(crate) struct GcTlab<'h> {
    heap: &'h HeapInner,
    to: &'h Belt,
    current: GcBuffer,
    pending: Vec<GcBuffer>,
}

impl<'h> GcTlab<'h> {
    pub(crate) fn new(heap: &'h HeapInner, to: &'h Belt) -> Self {
        Self {
            heap,
            to,
            current: GcBuffer::unset(),
            pending: Vec::new(),
        }
    }

    #[cold]
    fn refill_and_alloc(&mut self, size: usize) -> Address {
        self.seal_current();

        let span = self.heap.settings.span_size;
        let wanted = self.heap.settings.gc_tlab_size.max(size);
        let buffer = (wanted + span - 1) & !(span - 1);
        match self.to.gc_allocate_aligned(buffer, span) {
            None => Address::zero(),
            Some((gap, start)) => {
                if start > gap {
                    // SAFETY: [gap, start) was reserved by the same bump
                    unsafe { Header::install_filler(gap, start.offset_from(gap)) };
                }
                self.heap.side.mark_creating(start);
                self.current = GcBuffer {
                    start,
                    scanned: start,
                    top: start.plus(size),
                    end: start.plus(buffer),
                };
                start
            }
        }
    }

    /// Seals the current buffer: tail filled for parseability, block
    /// recorded in the side table as SCAVENGED so no other thread will
    /// claim it, pending if this thread still has copies to scan there.
    fn seal_current(&mut self) {
        let buffer = std::mem::replace(&mut self.current, GcBuffer::unset());
        if !buffer.is_set() {
            return;
        }
        if buffer.top < buffer.end {
            // SAFETY: the tail is private to this thread until sealed
            unsafe {
                Header::install_filler(buffer.top, buffer.end.offset_from(buffer.top));
            }
        }
        // the block goes into the table as SCAVENGED directly, never as a
        // transiently claimable START
        let side = &self.heap.side;
        let first = side.index_of(buffer.start);
        let last = side.index_of(buffer.end.minus(1));
        for i in first + 1..=last {
            side.set_state(i, CHUNK_MIDDLE);
        }
        side.set_state(first, CHUNK_SCAVENGED);
        if buffer.scanned < buffer.top {
            self.pending.push(buffer);
        }
    }

    /// Next run of copies this thread has made but not yet scanned.
    fn next_unscanned(&mut self) -> Option<BeltView> {
        if self.current.scanned < self.current.top {
            let view = BeltView {
                start: self.current.scanned,
                end: self.current.top,
            };
            self.current.scanned = self.current.top;
            return Some(view);
        }
        while let Some(buffer) = self.pending.last_mut() {
            if buffer.scanned < buffer.top {
                let view = BeltView {
                    start: buffer.scanned,
                    end: buffer.top,
                };
                buffer.scanned = buffer.top;
                return Some(view);
            }
            self.pending.pop();
        }
        None
    }

    /// Worker teardown. Everything must have been drained already.
    fn finish(mut self) {
        debug_assert!(self.current.scanned == self.current.top);
        debug_assert!(self.pending.iter().all(|b| b.scanned == b.top));
        self.seal_current();
        self.pending.clear();
    }

    /// Coordinator handoff: re-publish every buffer still holding
    /// unscanned copies as a claimable START block for the workers.
    fn publish_claimable(mut self) {
        self.seal_current();
        for buffer in &self.pending {
            self.heap
                .side
                .set_state(self.heap.side.index_of(buffer.start), CHUNK_START);
        }
        self.pending.clear();
    }
}

impl GcAllocator for GcTlab<'_> {
    #[inline]
    fn alloc_copy(&mut self, size: usize) -> Address {
        if self.current.is_set() {
            let new = self.current.top.plus(size);
            if new <= self.current.end {
                let cell = self.current.top;
                self.current.top = new;
                return cell;
            }
        }
        self.refill_and_alloc(size)
    }

    fn retract(&mut self, cell: Address, size: usize) -> bool {
        if self.current.top == cell.plus(size) {
            self.current.top = cell;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::settings::HeapSettings;
    use crate::side::CHUNK_CREATING;
    use crate::testlayout;
    use std::collections::HashSet;

    struct SlotRoots {
        slots: Vec<Address>,
    }

    impl SlotRoots {
        fn new() -> Self {
            Self { slots: Vec::new() }
        }
    }

    impl RootProvider for SlotRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
            for slot in self.slots.iter_mut() {
                visitor(slot);
            }
        }
    }

    fn two_belt_heap(parallel: bool) -> Heap {
        let settings = HeapSettings {
            heap_size: 4 << 20,
            belt_percentages: vec![25, 75],
            parallel,
            gc_threads: 4,
            verify: cfg!(debug_assertions),
            ..HeapSettings::default()
        };
        Heap::new(settings, testlayout::model()).expect("heap construction")
    }

    #[test]
    fn promotion_moves_live_cells_and_resets_the_young_belt() {
        // 1 MiB young belt, 3 MiB elder; 300 cells of 2 KiB, every
        // fourth kept alive through a root
        let heap = two_belt_heap(false);
        let mut proxy = heap.proxy();
        let mut roots = SlotRoots::new();
        let cell_bytes = 2048;

        for i in 0..300 {
            let cell = proxy.allocate(cell_bytes, &mut roots);
            testlayout::write_cell(cell, cell_bytes, &[]);
            if i % 4 == 0 {
                roots.slots.push(cell);
            }
        }
        let free_before = heap.report_free_space();

        assert!(proxy.trigger_collection(1, &mut roots));

        let inner = heap.inner();
        let young = inner.manager.youngest();
        let eldest = inner.manager.eldest();

        assert_eq!(young.used(), 0);
        assert_eq!(young.mark(), young.start());
        assert_eq!(eldest.used(), 75 * cell_bytes);
        // the garbage died, so more is free than before the cycle
        assert!(heap.report_free_space() > free_before);
        assert_eq!(
            heap.report_free_space(),
            young.size() + eldest.free()
        );

        let mut seen = HashSet::new();
        for &root in &roots.slots {
            assert!(eldest.contains(root));
            assert!(seen.insert(root));
            // SAFETY: promoted cells are live
            assert_eq!(unsafe { Header::at(root) }.size(), cell_bytes);
        }
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    fn parallel_cycle_preserves_a_long_chain() {
        let heap = two_belt_heap(true);
        let mut proxy = heap.proxy();
        let mut roots = SlotRoots::new();

        // 10,000 64-byte cells linked head to tail
        let count = 10_000;
        let cell_bytes = testlayout::cell_size(1, 4);
        assert_eq!(cell_bytes, 64);

        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            cells.push(proxy.allocate(cell_bytes, &mut roots));
        }
        for (i, &cell) in cells.iter().enumerate() {
            let next = cells.get(i + 1).copied().unwrap_or(Address::zero());
            testlayout::write_cell(cell, cell_bytes, &[next]);
        }
        roots.slots.push(cells[0]);

        assert!(proxy.trigger_collection(1, &mut roots));

        let inner = heap.inner();
        let eldest = inner.manager.eldest();
        assert_eq!(inner.manager.youngest().used(), 0);

        // chain fully relocated, each link exactly once
        let mut seen = HashSet::new();
        let mut cursor = roots.slots[0];
        while !cursor.is_zero() {
            assert!(eldest.contains(cursor));
            assert!(seen.insert(cursor));
            // SAFETY: promoted cells are live
            assert_eq!(unsafe { Header::at(cursor) }.size(), cell_bytes);
            cursor = testlayout::get_ref(cursor, 0);
        }
        assert_eq!(seen.len(), count);

        // the elder region is tiled with restored claimable blocks
        let side = &inner.side;
        let first = side.index_of(eldest.start());
        let last = side.index_of(eldest.mark().minus(1));
        let mut starts = 0;
        for i in first..=last {
            let state = side.state(i);
            assert_ne!(state, CHUNK_CREATING);
            assert_ne!(state, CHUNK_SCAVENGED);
            if state == CHUNK_START {
                starts += 1;
            }
        }
        assert!(starts > 0);
    }

    #[test]
    fn dirty_cards_keep_elder_to_young_references_alive() {
        let heap = two_belt_heap(false);
        let mut proxy = heap.proxy();
        let mut roots = SlotRoots::new();
        let size = testlayout::cell_size(1, 2);

        let holder = proxy.allocate(size, &mut roots);
        testlayout::write_cell(holder, size, &[Address::zero()]);
        roots.slots.push(holder);
        assert!(proxy.trigger_collection(1, &mut roots));

        let holder = roots.slots[0];
        assert!(heap.inner().manager.eldest().contains(holder));

        // young cell referenced only through the promoted holder
        let young = proxy.allocate(size, &mut roots);
        testlayout::write_cell(young, size, &[Address::zero()]);
        testlayout::set_ref(holder, 0, young);
        proxy.write_barrier(testlayout::ref_slot(holder, 0));

        assert!(proxy.trigger_collection(1, &mut roots));

        let target = testlayout::get_ref(roots.slots[0], 0);
        assert!(!target.is_zero());
        assert!(heap.inner().manager.eldest().contains(target));
        // SAFETY: the promoted cell is live
        assert_eq!(unsafe { Header::at(target) }.size(), size);
    }

    #[test]
    fn exhaustion_triggers_collection_automatically() {
        let settings = HeapSettings {
            heap_size: 2 << 20,
            belt_percentages: vec![25, 75],
            parallel: false,
            verify: cfg!(debug_assertions),
            ..HeapSettings::default()
        };
        let heap = Heap::new(settings, testlayout::model()).expect("heap construction");
        let mut proxy = heap.proxy();
        let mut roots = SlotRoots::new();
        let cell_bytes = 2048;

        // 2 MiB of allocation through a 512 KiB young belt
        for i in 0..1000 {
            let cell = proxy.allocate(cell_bytes, &mut roots);
            testlayout::write_cell(cell, cell_bytes, &[]);
            if i % 10 == 0 {
                roots.slots.push(cell);
            }
        }

        assert!(heap.stats().collections >= 1);
        for &root in &roots.slots {
            // SAFETY: rooted cells stay live across cycles
            let header = unsafe { Header::at(root) };
            assert_eq!(header.size(), cell_bytes);
            assert!(header.forwarding().is_zero());
        }
    }

    #[test]
    fn major_collection_compacts_the_eldest_belt() {
        let settings = HeapSettings {
            heap_size: 2 << 20,
            belt_percentages: vec![50, 50],
            parallel: false,
            verify: cfg!(debug_assertions),
            ..HeapSettings::default()
        };
        let heap = Heap::new(settings, testlayout::model()).expect("heap construction");
        let mut proxy = heap.proxy();
        let mut roots = SlotRoots::new();
        let cell_bytes = 4096;

        // churn: fill the eldest belt with mostly-dead promotions until
        // a major collection compacts it
        for round in 0..16 {
            for i in 0..128 {
                let cell = proxy.allocate(cell_bytes, &mut roots);
                testlayout::write_cell(cell, cell_bytes, &[]);
                if i == 0 && round == 0 {
                    roots.slots.push(cell);
                }
            }
            proxy.trigger_collection(1, &mut roots);
            if heap.stats().major_collections > 0 {
                break;
            }
        }

        assert!(heap.stats().major_collections >= 1);
        let root = roots.slots[0];
        assert!(heap.inner().manager.eldest().contains(root));
        // SAFETY: the rooted cell survived every cycle
        assert_eq!(unsafe { Header::at(root) }.size(), cell_bytes);
    }

    #[test]
    fn concurrent_mutators_survive_collections() {
        use std::sync::Arc;

        let settings = HeapSettings {
            heap_size: 4 << 20,
            belt_percentages: vec![25, 75],
            parallel: true,
            gc_threads: 2,
            ..HeapSettings::default()
        };
        let heap =
            Arc::new(Heap::new(settings, testlayout::model()).expect("heap construction"));
        let cell_bytes = 256;

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    let mut proxy = heap.proxy();
                    let mut roots = SlotRoots::new();
                    for i in 0..2000 {
                        let cell = proxy.allocate(cell_bytes, &mut roots);
                        testlayout::write_cell(cell, cell_bytes, &[]);
                        if i % 50 == 0 {
                            roots.slots.push(cell);
                        }
                        proxy.safepoint(&mut roots);
                    }
                    // a cycle cannot complete while this thread is
                    // between polls, so the roots stay put here
                    for &root in &roots.slots {
                        // SAFETY: rooted cells are live
                        assert_eq!(unsafe { Header::at(root) }.size(), cell_bytes);
                    }
                    roots.slots.len()
                })
            })
            .collect();

        let mut total_roots = 0;
        for handle in handles {
            total_roots += handle.join().unwrap();
        }
        assert_eq!(total_roots, 3 * 40);
        assert!(heap.stats().collections >= 1);
    }
}
