//! Stop-the-world coordination between mutator threads and the collector.
//!
//! Every mutator registers a [`MutatorThread`] handle and polls
//! [`MutatorThread::safepoint_poll`] at its allocation and call edges.
//! When a collection triggers, the coordinating thread freezes the world:
//! it requests a safepoint from every other registered mutator, waits for
//! each to park with its root set prepared, runs the collection while it
//! alone is running, then releases everyone. A parked mutator's prepared
//! roots are rewritten in place by the collector and written back into
//! the mutator's real slots when it wakes.
//!
//! A thread that is still starting up blocks on the registry lock before
//! it can touch the heap, so it needs no explicit safepoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::address::Address;
use crate::object::RootProvider;

struct MutatorState {
    parked: bool,
    /// Root values captured when the thread parked. The collector
    /// rewrites these; the thread writes them back on wake.
    roots: Vec<Address>,
}

pub struct MutatorThread {
    id: usize,
    /// Fast-path flag checked by the poll before touching the mutex.
    requested: AtomicBool,
    state: Mutex<MutatorState>,
    cvar: Condvar,
}

impl MutatorThread {
    fn new(id: usize) -> Self {
        Self {
            id,
            requested: AtomicBool::new(false),
            state: Mutex::new(MutatorState {
                parked: false,
                roots: Vec::new(),
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// True when a collection is waiting for this thread to park. Lets
    /// the owning proxy retire its TLAB before parking.
    #[inline(always)]
    pub fn safepoint_pending(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Safepoint check. Returns immediately when no collection is
    /// pending; otherwise prepares this thread's roots, parks until the
    /// collection finishes, and writes the possibly-relocated roots back
    /// through `provider`.
    #[inline]
    pub fn safepoint_poll(&self, provider: &mut dyn RootProvider) {
        if !self.requested.load(Ordering::Acquire) {
            return;
        }
        self.park(provider);
    }

    #[cold]
    fn park(&self, provider: &mut dyn RootProvider) {
        let mut roots = Vec::new();
        provider.visit_roots(&mut |slot| roots.push(*slot));

        let mut state = self.state.lock();
        state.roots = roots;
        state.parked = true;
        self.cvar.notify_all();

        while self.requested.load(Ordering::Acquire) {
            self.cvar.wait(&mut state);
        }

        state.parked = false;
        let updated = std::mem::take(&mut state.roots);
        let mut i = 0;
        provider.visit_roots(&mut |slot| {
            *slot = updated[i];
            i += 1;
        });
    }

    fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    fn wait_parked(&self) {
        let mut state = self.state.lock();
        while !state.parked {
            self.cvar.wait(&mut state);
        }
    }

    fn release(&self) {
        // hold the lock across the notify so the wake is not lost
        let _state = self.state.lock();
        self.requested.store(false, Ordering::Release);
        self.cvar.notify_all();
    }
}

/// Root slots of all parked mutators, handed to the collection procedure
/// while the world is frozen.
pub struct FrozenThreads<'a> {
    threads: &'a [Arc<MutatorThread>],
    coordinator: usize,
}

impl FrozenThreads<'_> {
    /// Visits every prepared root slot of every parked mutator. Slots
    /// may be rewritten; the owning threads write the new values back
    /// when they resume.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Address)) {
        for thread in self.threads {
            if thread.id == self.coordinator {
                continue;
            }
            let mut state = thread.state.lock();
            debug_assert!(state.parked);
            for slot in state.roots.iter_mut() {
                visitor(slot);
            }
        }
    }
}

pub struct MutatorRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicUsize,
    /// Id of the thread currently holding the freeze role, zero if none.
    freeze_owner: AtomicUsize,
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            freeze_owner: AtomicUsize::new(0),
        }
    }

    pub fn register(&self) -> Arc<MutatorThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(MutatorThread::new(id));
        self.threads.lock().push(thread.clone());
        thread
    }

    pub fn deregister(&self, thread: &Arc<MutatorThread>) {
        // a freeze already waiting on this thread sees it parked with no
        // roots instead of blocking on a poll that will never come
        {
            let mut state = thread.state.lock();
            state.roots.clear();
            state.parked = true;
            thread.cvar.notify_all();
        }
        self.threads.lock().retain(|t| t.id != thread.id);
        thread.state.lock().parked = false;
    }

    pub fn mutator_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Stops every registered mutator except the coordinator, runs `f`
    /// with their prepared roots, then resumes them. Two threads holding
    /// the freeze role at once is an invariant violation and aborts.
    pub fn freeze<R>(
        &self,
        coordinator: usize,
        f: impl FnOnce(&FrozenThreads) -> R,
    ) -> R {
        let threads = self.threads.lock();

        let prev = self.freeze_owner.swap(coordinator, Ordering::AcqRel);
        assert!(
            prev == 0,
            "thread {coordinator} tried to freeze while thread {prev} holds the freeze"
        );

        for thread in threads.iter() {
            if thread.id != coordinator {
                thread.request();
            }
        }
        for thread in threads.iter() {
            if thread.id != coordinator {
                thread.wait_parked();
            }
        }

        let frozen = FrozenThreads {
            threads: &threads,
            coordinator,
        };
        let result = f(&frozen);

        self.freeze_owner.store(0, Ordering::Release);
        for thread in threads.iter() {
            if thread.id != coordinator {
                thread.release();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SlotRoots {
        slots: Vec<Address>,
    }

    impl RootProvider for SlotRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
            for slot in self.slots.iter_mut() {
                visitor(slot);
            }
        }
    }

    #[test]
    fn freeze_sees_and_rewrites_mutator_roots() {
        let registry = Arc::new(MutatorRegistry::new());
        let coordinator = registry.register();

        let mutators = 3;
        let handles: Vec<_> = (0..mutators)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let me = registry.register();
                    let mut roots = SlotRoots {
                        slots: vec![Address::new(0x1000 + t), Address::new(0x2000 + t)],
                    };
                    // poll until released, like a mutator loop would
                    loop {
                        me.safepoint_poll(&mut roots);
                        if roots.slots[0].raw() >= 0x9000 {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    registry.deregister(&me);
                    roots.slots
                })
            })
            .collect();

        // let the mutators register
        while registry.mutator_count() < mutators + 1 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut seen = 0;
        registry.freeze(coordinator.id(), |frozen| {
            frozen.visit_roots(&mut |slot| {
                seen += 1;
                *slot = Address::new(slot.raw() + 0x8000);
            });
        });
        assert_eq!(seen, mutators * 2);

        for (t, handle) in handles.into_iter().enumerate() {
            let slots = handle.join().unwrap();
            assert_eq!(slots[0], Address::new(0x9000 + t));
            assert_eq!(slots[1], Address::new(0xA000 + t));
        }
    }

    #[test]
    fn freeze_with_only_the_coordinator_runs_immediately() {
        let registry = MutatorRegistry::new();
        let me = registry.register();
        let ran = registry.freeze(me.id(), |frozen| {
            let mut count = 0;
            frozen.visit_roots(&mut |_| count += 1);
            count
        });
        assert_eq!(ran, 0);
    }
}
