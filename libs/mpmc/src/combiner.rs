//! Flat-combining delegation built directly on [`Ring`].
//!
//! A [`Combiner`] serializes a contended critical section without ever taking a lock: callers
//! enqueue a job onto the ring, then race to become the *combiner* for a batch. The thread that
//! wins drains up to [`Combiner::HANDOFF`] queued jobs and runs them itself, in ring order, before
//! releasing the combining flag; everyone else spins until their own job is marked done. FIFO
//! order across contending threads falls directly out of the ring's enqueue order.

use crate::Ring;
use crossbeam_utils::Backoff;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type Job = Box<dyn FnOnce() + Send>;

struct Slot {
    job: Mutex<Option<Job>>,
    done: AtomicBool,
}

/// A flat-combining executor: many threads submit closures, one at a time actually runs them.
///
/// Useful for serializing updates to a data structure that has no natural lock-free design
/// (e.g. a shared statistics aggregate) without forcing every caller to block on a mutex.
pub struct Combiner {
    ring: Ring<Arc<Slot>>,
    combining: AtomicBool,
}

impl Combiner {
    /// Maximum number of jobs a single combining pass will execute before handing off, so
    /// that no thread can be starved waiting behind an unbounded batch.
    pub const HANDOFF: usize = 32;

    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
            combining: AtomicBool::new(false),
        }
    }

    /// Runs `f` in the combiner's single critical path, blocking (via spin) until it has
    /// executed either by this thread or by whichever thread is currently combining.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(Slot {
            job: Mutex::new(Some(Box::new(f) as Job)),
            done: AtomicBool::new(false),
        });

        // If the ring is momentarily full, run as our own combining batch of one: correctness
        // doesn't depend on every job going through the ring, only on FIFO order among jobs
        // that did.
        if self.ring.try_enqueue(slot.clone()).is_err() {
            self.run_job(&slot);
            return;
        }

        self.drive(&slot);
    }

    fn drive(&self, mine: &Arc<Slot>) {
        let backoff = Backoff::new();
        loop {
            if mine.done.load(Ordering::Acquire) {
                return;
            }

            if self
                .combining
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let mut ran = 0;
                for _ in 0..Self::HANDOFF {
                    match self.ring.try_dequeue() {
                        Ok(slot) => {
                            self.run_job(&slot);
                            ran += 1;
                        }
                        Err(_) => break,
                    }
                }
                tracing::trace!(ran, "combining batch complete");
                self.combining.store(false, Ordering::Release);
                // One more check: our own job may have been drained by the batch we just ran.
                if mine.done.load(Ordering::Acquire) {
                    return;
                }
            } else {
                backoff.spin();
            }
        }
    }

    fn run_job(&self, slot: &Arc<Slot>) {
        if let Some(job) = slot.job.lock().unwrap().take() {
            // A panicking job must not poison the combining path for unrelated callers; the
            // panic is swallowed here and the slot is still marked done so its owner doesn't
            // spin forever. The owner observes no return value, matching `execute`'s `FnOnce()`
            // contract (no result is threaded back).
            let _ = catch_unwind(AssertUnwindSafe(job));
        }
        slot.done.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn serializes_increments() {
        let combiner = Arc::new(Combiner::new(64));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let combiner = combiner.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let counter = counter.clone();
                        combiner.execute(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 16 * 200);
    }
}
