//! A bounded, lock-free multi-producer multi-consumer ring buffer.
//!
//! This is the primitive underneath the async-call transport (one ring per execution
//! context) and the flat-combining [`Combiner`]: a fixed-size array of slots, each carrying
//! its own sequence number ("lock") so that producers and consumers can claim a slot with a
//! single `fetch_add` instead of a global lock.
//!
//! Based on the classic bounded MPMC queue design described at
//! <http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue>.
//!
//! [`Combiner`]: crate::Combiner

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod combiner;
mod loom;

pub use combiner::Combiner;

use crate::loom::UnsafeCell;
use crate::loom::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::{Backoff, CachePadded};
use std::fmt;
use std::mem::MaybeUninit;

/// Error returned by [`Ring::try_enqueue`] when every slot is currently occupied.
#[derive(Debug, PartialEq, Eq)]
pub struct Full<T>(pub T);

/// Error returned by [`Ring::try_dequeue`] when no slot currently holds a value.
#[derive(Debug, PartialEq, Eq)]
pub struct Empty;

struct Slot<T> {
    /// Sequence number ("lock"). Slot `i` starts at `lock == i`; after a value is
    /// published the slot advances to `i + 1`; after it is drained it advances to
    /// `i + 1 + mask` (i.e. the index of its next round).
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded MPMC ring buffer with capacity a power of two.
///
/// Cloning the handle is cheap ([`Ring`] is usually stored behind an `Arc`); all methods take
/// `&self` since synchronization is entirely lock-free.
pub struct Ring<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    tail: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
}

// Safety: `Slot<T>`'s sequence number gates all access to its `UnsafeCell`, so the ring is Sync
// whenever `T` is Send (the same guarantee `std::sync::mpsc` and `crossbeam_channel` provide).
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &(self.mask + 1))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Ring<T> {
    /// Creates a new ring with the given capacity, which is rounded up to the next power of
    /// two (with a minimum of 16, per the async-queue sizing rule in the runtime's config).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Number of slots in this ring. Always a power of two.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempts to enqueue `value`, returning the producer's claimed stamp on success.
    ///
    /// The stamp is the pre-increment value of the tail counter and is monotonically
    /// increasing; callers use it to decide whether a parked consumer observed this
    /// enqueue (see the listener notify protocol).
    ///
    /// Returns `Err(Full(value))` immediately if the ring is full; this call never blocks
    /// indefinitely, but does spin briefly against in-flight producers/consumers still
    /// completing a claimed slot.
    pub fn try_enqueue(&self, value: T) -> Result<usize, Full<T>> {
        let mut backoff = Backoff::new();
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = (seq as isize).wrapping_sub(pos as isize);

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => {
                        pos = cur;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                // The slot at `pos` has not been drained from its previous round: the ring
                // is full.
                return Err(Full(value));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
                backoff.spin();
            }
        }

        let slot = &self.buffer[pos & self.mask];
        slot.value.with_mut(|p| unsafe {
            (*p).write(value);
        });
        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
        Ok(pos)
    }

    /// Enqueues `value`, spinning with escalating backoff until a slot becomes free.
    ///
    /// Used only by callers that have already decided blocking is acceptable (e.g. the
    /// remote-free retry path); most runtime call sites prefer [`try_enqueue`] so they can
    /// apply their own retry/defer policy.
    ///
    /// [`try_enqueue`]: Ring::try_enqueue
    pub fn enqueue(&self, mut value: T) -> usize {
        loop {
            match self.try_enqueue(value) {
                Ok(stamp) => return stamp,
                Err(Full(v)) => {
                    value = v;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Attempts to dequeue a value, returning `Err(Empty)` if no slot is currently ready.
    pub fn try_dequeue(&self) -> Result<T, Empty> {
        let mut backoff = Backoff::new();
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = (seq as isize).wrapping_sub(pos.wrapping_add(1) as isize);

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => {
                        pos = cur;
                        backoff.spin();
                    }
                }
            } else if diff < 0 {
                return Err(Empty);
            } else {
                pos = self.head.load(Ordering::Relaxed);
                backoff.spin();
            }
        }

        let slot = &self.buffer[pos & self.mask];
        let value = slot.value.with(|p| unsafe { (*p).assume_init_read() });
        slot.seq
            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
        Ok(value)
    }

    /// Drains every value currently available without blocking, calling `f` for each.
    ///
    /// Used by the listener to empty its async-call queue before returning to the poller;
    /// stops as soon as the ring reports empty rather than chasing concurrent producers
    /// indefinitely.
    pub fn drain(&self, mut f: impl FnMut(T)) -> usize {
        let mut n = 0;
        while let Ok(value) = self.try_dequeue() {
            f(value);
            n += 1;
        }
        n
    }

    /// Snapshot of the consumer-side counter: how many items have been claimed for dequeue so
    /// far. Used by a listener to remember "I had drained up to here" before parking, so a
    /// later poster can tell whether its enqueue happened before or after that snapshot.
    pub fn dequeue_stamp(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    /// Returns `true` if the ring currently holds no values.
    ///
    /// This is a snapshot, not a synchronization point: concurrent producers may make it
    /// stale immediately after it is observed.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drain any values still queued so their destructors run.
        while self.try_dequeue().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering as StdOrdering;

    #[test]
    fn single_threaded_round_trip() {
        let ring = Ring::new(4);
        assert_eq!(ring.capacity(), 4);
        assert!(ring.is_empty());

        for i in 0..4 {
            ring.try_enqueue(i).unwrap();
        }
        assert!(ring.try_enqueue(99).is_err());

        for i in 0..4 {
            assert_eq!(ring.try_dequeue().unwrap(), i);
        }
        assert!(ring.try_dequeue().is_err());
    }

    #[test]
    fn wraps_around_many_rounds() {
        let ring = Ring::new(8);
        for round in 0..1000 {
            ring.try_enqueue(round).unwrap();
            assert_eq!(ring.try_dequeue().unwrap(), round);
        }
    }

    #[test]
    fn enqueue_stamp_is_monotonic() {
        let ring = Ring::new(16);
        let mut last = None;
        for i in 0..10 {
            let stamp = ring.try_enqueue(i).unwrap();
            if let Some(last) = last {
                assert!(stamp > last);
            }
            last = Some(stamp);
        }
    }

    #[test]
    fn mpmc_preserves_per_producer_order_and_total_count() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 2000;

        let ring: Arc<Ring<(usize, usize)>> = Arc::new(Ring::new(64));
        let producers_done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        ring.enqueue((p, i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = ring.clone();
                let producers_done = producers_done.clone();
                std::thread::spawn(move || {
                    let mut last_seen = [None; PRODUCERS];
                    let mut seen = Vec::new();
                    loop {
                        match ring.try_dequeue() {
                            Ok((p, i)) => {
                                if let Some(prev) = last_seen[p] {
                                    assert!(i > prev, "item reordered within producer {p}");
                                }
                                last_seen[p] = Some(i);
                                seen.push((p, i));
                            }
                            Err(Empty) => {
                                if producers_done.load(StdOrdering::Acquire) && ring.is_empty() {
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        producers_done.store(true, StdOrdering::Release);

        let total: usize = consumers
            .into_iter()
            .map(|c| c.join().unwrap().len())
            .sum();

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
    }
}
