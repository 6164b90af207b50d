//! The heap facade: construction, mutator proxies, TLAB allocation, the
//! write barrier, and collection triggering.
//!
//! A [`Heap`] owns the mapping, the belts, both byte tables and the
//! mutator registry. Each mutator thread holds a [`HeapProxy`] carrying
//! its TLAB and safepoint handle; all allocation goes through the proxy.
//! Proxies learn that a collection invalidated their TLAB through a heap
//! epoch counter instead of the collector reaching into other threads'
//! state.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::address::{Address, WORD_SIZE};
use crate::belt::ALLOC_SKEW;
use crate::card::CardTable;
use crate::collector;
use crate::manager::BeltManager;
use crate::object::{HEADER_SIZE, Header, ObjectModel, RootProvider};
use crate::safepoint::{MutatorRegistry, MutatorThread};
use crate::settings::HeapSettings;
use crate::side::SideTable;
use crate::system;

/// Counters accumulated across collections. Snapshots are cheap clones.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub collections: usize,
    pub major_collections: usize,
    pub copied_cells: usize,
    pub copied_bytes: usize,
    pub last_pause: Duration,
    pub total_pause: Duration,
}

pub type GcHook = Box<dyn Fn(&GcStats) + Send + Sync>;

pub(crate) struct HeapInner {
    pub settings: HeapSettings,
    pub model: ObjectModel,
    base: NonNull<u8>,
    map_size: usize,
    pub manager: BeltManager,
    pub cards: CardTable,
    pub side: SideTable,
    pub registry: MutatorRegistry,
    pub global_roots: Mutex<Vec<Address>>,
    /// Bumped at every cycle prologue; proxies with a stale epoch drop
    /// their TLAB before touching it again.
    pub epoch: AtomicUsize,
    /// Claimed by the mutator that will coordinate the next cycle.
    gc_claim: AtomicBool,
    pub stats: Mutex<GcStats>,
    pub pre_gc_hooks: Mutex<Vec<GcHook>>,
    pub post_gc_hooks: Mutex<Vec<GcHook>>,
}

// SAFETY: all access to the shared mapping goes through belt marks, the
// byte tables and the registry, which synchronize.
unsafe impl Send for HeapInner {}
// SAFETY: as above
unsafe impl Sync for HeapInner {}

impl Drop for HeapInner {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.map_size);
    }
}

impl HeapInner {
    pub fn heap_start(&self) -> Address {
        self.manager.heap_start()
    }

    pub fn heap_end(&self) -> Address {
        self.manager.heap_end()
    }

    pub fn current_epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn report_free_space(&self) -> usize {
        self.manager.belts().iter().map(|b| b.free()).sum()
    }

    /// Best-effort human-readable dump of belt and table state.
    pub fn print_diagnostics(&self) {
        info!(
            "heap {} - {} ({} bytes, epoch {})",
            self.heap_start(),
            self.heap_end(),
            self.map_size,
            self.current_epoch()
        );
        for belt in self.manager.belts() {
            info!(
                "  belt {}: {} - {} mark {} ({} used, {} free{})",
                belt.index(),
                belt.start(),
                belt.end(),
                belt.mark(),
                belt.used(),
                belt.free(),
                if belt.is_expandable() {
                    ", expandable"
                } else {
                    ""
                }
            );
        }
        let dirty = (0..self.cards.card_count())
            .filter(|&i| self.cards.is_dirty(i))
            .count();
        let starts = (0..self.side.chunk_count())
            .filter(|&i| self.side.state(i) == crate::side::CHUNK_START)
            .count();
        info!(
            "  cards: {dirty}/{} dirty, side: {starts}/{} block starts",
            self.cards.card_count(),
            self.side.chunk_count()
        );
    }
}

#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

impl Heap {
    pub fn new(settings: HeapSettings, model: ObjectModel) -> Result<Self, &'static str> {
        settings.validate()?;

        let map_size = system::round_to_page(settings.heap_size);
        let base = system::map_memory(map_size).ok_or("heap mapping failed")?;
        let start = Address::new(base.as_ptr() as usize);

        let manager = BeltManager::new(start, map_size, &settings.belt_percentages);
        let cards = CardTable::new(start, map_size, settings.span_size);
        let side = SideTable::new(start, map_size, settings.span_size);

        debug!(
            "heap mapped at {start}, {} belts over {map_size} bytes",
            manager.belt_count()
        );

        Ok(Self {
            inner: Arc::new(HeapInner {
                settings,
                model,
                base,
                map_size,
                manager,
                cards,
                side,
                registry: MutatorRegistry::new(),
                global_roots: Mutex::new(Vec::new()),
                epoch: AtomicUsize::new(0),
                gc_claim: AtomicBool::new(false),
                stats: Mutex::new(GcStats::default()),
                pre_gc_hooks: Mutex::new(Vec::new()),
                post_gc_hooks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Registers the calling thread as a mutator and hands it its proxy.
    pub fn proxy(&self) -> HeapProxy {
        let thread = self.inner.registry.register();
        HeapProxy {
            heap: self.inner.clone(),
            thread,
            tlab: Tlab::unset(),
            epoch: self.inner.current_epoch(),
        }
    }

    /// Adds a root slot the collector updates in place, returning its
    /// index.
    pub fn add_global_root(&self, reference: Address) -> usize {
        let mut roots = self.inner.global_roots.lock();
        roots.push(reference);
        roots.len() - 1
    }

    pub fn global_root(&self, index: usize) -> Address {
        self.inner.global_roots.lock()[index]
    }

    pub fn set_global_root(&self, index: usize, reference: Address) {
        self.inner.global_roots.lock()[index] = reference;
    }

    pub fn add_pre_gc_hook(&self, hook: GcHook) {
        self.inner.pre_gc_hooks.lock().push(hook);
    }

    pub fn add_post_gc_hook(&self, hook: GcHook) {
        self.inner.post_gc_hooks.lock().push(hook);
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.inner.settings
    }

    pub fn report_free_space(&self) -> usize {
        self.inner.report_free_space()
    }

    pub fn print_diagnostics(&self) {
        self.inner.print_diagnostics()
    }

    pub fn stats(&self) -> GcStats {
        self.inner.stats.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &HeapInner {
        &self.inner
    }
}

/// A thread's private carve of the young belt.
struct Tlab {
    start: Address,
    top: Address,
    end: Address,
}

impl Tlab {
    fn unset() -> Self {
        Self {
            start: Address::zero(),
            top: Address::zero(),
            end: Address::zero(),
        }
    }

    fn is_set(&self) -> bool {
        !self.start.is_zero()
    }

    fn new(start: Address, size: usize) -> Self {
        Self {
            start,
            top: start,
            end: start.plus(size),
        }
    }

    #[inline(always)]
    fn allocate(&mut self, size: usize) -> Address {
        // an unset buffer takes the refill path
        if !self.is_set() {
            return Address::zero();
        }
        let cell = self.top.plus(ALLOC_SKEW);
        let new = cell.plus(size);
        if new > self.end {
            return Address::zero();
        }
        #[cfg(debug_assertions)]
        // SAFETY: [top, new) is inside this thread's private buffer
        unsafe {
            self.top.write_word(crate::object::DEBUG_TAG);
        }
        self.top = new;
        cell
    }

    /// Plugs the unused tail with a filler cell so the belt stays
    /// linearly parseable, then drops the buffer.
    fn retire(&mut self) {
        if self.is_set() && self.top < self.end {
            // SAFETY: the tail is private to this thread until retired
            unsafe {
                Header::install_filler(self.top, self.end.offset_from(self.top));
            }
        }
        *self = Tlab::unset();
    }
}

/// Per-mutator heap handle. Each thread gets its own from
/// [`Heap::proxy`]; sharing one between threads breaks the TLAB and
/// safepoint protocol.
pub struct HeapProxy {
    heap: Arc<HeapInner>,
    thread: Arc<MutatorThread>,
    tlab: Tlab,
    epoch: usize,
}

impl HeapProxy {
    pub fn thread_id(&self) -> usize {
        self.thread.id()
    }

    /// Allocates `size` bytes (at least a header, rounded up to word
    /// granularity) for a new cell. The caller installs the header. May
    /// run a collection; a request no collection can satisfy is fatal.
    #[inline]
    pub fn allocate(&mut self, size: usize, roots: &mut dyn RootProvider) -> Address {
        let size = Self::round_request(size);
        self.refresh_epoch();
        if size >= self.heap.settings.direct_allocation_threshold {
            return self.allocate_direct(size, roots);
        }
        let cell = self.tlab.allocate(size);
        if !cell.is_zero() {
            return cell;
        }
        self.allocate_slow(size, roots)
    }

    #[inline(always)]
    fn round_request(size: usize) -> usize {
        let size = size.max(HEADER_SIZE);
        (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
    }

    #[inline(always)]
    fn refresh_epoch(&mut self) {
        let current = self.heap.current_epoch();
        if self.epoch != current {
            // the belt this TLAB lived in was reset by a collection
            self.tlab = Tlab::unset();
            self.epoch = current;
        }
    }

    #[cold]
    fn allocate_slow(&mut self, size: usize, roots: &mut dyn RootProvider) -> Address {
        self.tlab.retire();

        let mut tlab_size = self.heap.settings.tlab_size;
        while tlab_size < size + ALLOC_SKEW {
            tlab_size *= 2;
        }

        for retried in [false, true] {
            self.refresh_epoch();
            let buffer = self.heap.manager.youngest().allocate_tlab(tlab_size);
            if !buffer.is_zero() {
                self.tlab = Tlab::new(buffer, tlab_size);
                let cell = self.tlab.allocate(size);
                debug_assert!(!cell.is_zero());
                return cell;
            }
            if retried || !self.trigger_collection(tlab_size, roots) {
                break;
            }
        }
        self.out_of_memory(size)
    }

    #[cold]
    fn allocate_direct(&mut self, size: usize, roots: &mut dyn RootProvider) -> Address {
        for retried in [false, true] {
            let cell = self.heap.manager.youngest().allocate(size);
            if !cell.is_zero() {
                return cell;
            }
            if retried || !self.trigger_collection(size + ALLOC_SKEW, roots) {
                break;
            }
        }
        self.out_of_memory(size)
    }

    #[cold]
    fn out_of_memory(&self, size: usize) -> ! {
        error!("allocation of {size} bytes failed after collection");
        self.heap.print_diagnostics();
        panic!("out of memory: {size} byte allocation");
    }

    /// Runs a stop-the-world cycle, or rides along with one another
    /// thread already started. Returns false when the young belt still
    /// cannot provide `minimum` bytes afterwards, in which case the
    /// caller may retry exactly once before treating the condition as
    /// fatal.
    pub fn trigger_collection(
        &mut self,
        minimum: usize,
        roots: &mut dyn RootProvider,
    ) -> bool {
        self.tlab.retire();
        let epoch_before = self.heap.current_epoch();

        if self
            .heap
            .gc_claim
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            collector::collect(&self.heap, self.thread.id(), roots);
            self.heap.gc_claim.store(false, Ordering::Release);
        } else {
            // another mutator coordinates; park when asked and wait for
            // its cycle to finish
            while self.heap.current_epoch() == epoch_before
                && self.heap.gc_claim.load(Ordering::Acquire)
            {
                self.thread.safepoint_poll(roots);
                std::thread::yield_now();
            }
        }

        self.refresh_epoch();
        self.heap.manager.youngest().free() >= minimum
    }

    /// Mutator write barrier. Call after storing a reference into the
    /// slot at `slot`; stores into the young belt need no barrier.
    #[inline(always)]
    pub fn write_barrier(&self, slot: Address) {
        if slot < self.heap.heap_start() || slot >= self.heap.heap_end() {
            return;
        }
        if !self.heap.manager.youngest().contains(slot) {
            self.heap.cards.dirty(slot);
        }
    }

    /// Safepoint check; call at allocation-free loop edges. Parks this
    /// thread (with its TLAB retired and roots prepared) while a
    /// collection runs.
    #[inline]
    pub fn safepoint(&mut self, roots: &mut dyn RootProvider) {
        if self.thread.safepoint_pending() {
            self.tlab.retire();
            self.thread.safepoint_poll(roots);
            self.refresh_epoch();
        }
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        self.tlab.retire();
        self.heap.registry.deregister(&self.thread);
    }
}
