use parking_lot::{Condvar, Mutex};

/// A reusable sense-reversing barrier that puts threads to sleep.
///
/// Threads rendezvous on it between phases of a shared run so that no
/// thread enters the next phase before every thread has left the
/// previous one. Mutators must not hold a registered proxy while they
/// sleep here, since a sleeping thread cannot reach a safepoint.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// Protected state: (current_count, current_sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
        }
    }

    /// Blocks the current thread until `until` have called this function.
    pub fn wait(&self, until: usize) {
        let mut state = self.state.lock();

        let my_sense = state.1;

        state.0 += 1;

        if state.0 == until {
            // LAST
            state.0 = 0;
            state.1 = !my_sense;

            self.cvar.notify_all();
        } else {
            // FOLLOWER
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn all_threads_pass_each_round() {
        let barrier = Arc::new(SenseBarrier::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let threads = 4;
        let rounds = 3;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = barrier.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for round in 0..rounds {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(threads);
                        // every thread has bumped the counter for this round
                        assert!(
                            counter.load(Ordering::SeqCst) >= (round + 1) * threads
                        );
                        barrier.wait(threads);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), threads * rounds);
    }
}
