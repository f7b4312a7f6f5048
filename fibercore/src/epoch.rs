//! Epoch-based reclamation (component G, §4.7): defers a closed sink's destruction until no
//! listener can still hold a reference acquired before the close, using a three-epoch scheme
//! (retire at epoch *E*, reclaim no earlier than *E + 2*).
//!
//! Limbo stacks and the retire queue are plain `Vec<Arc<Sink>>` rather than intrusive links
//! (§9's design notes steer away from raw pointer graphs); sinks are already `Arc` handles at
//! the public boundary, so this is a direct, safe translation of the source's structure.

use crate::listener::Listener;
use crate::sink::Sink;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global dispatcher epoch (§3): always odd, advances by 2.
#[derive(Debug)]
pub struct GlobalEpoch(AtomicUsize);

impl Default for GlobalEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalEpoch {
    pub fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Above what "many listeners still behind" means before `advance` bothers nudging them
    /// with a "please observe" post (§4.7: "when count > 8").
    const NUDGE_THRESHOLD: usize = 8;
}

/// Per-listener local epoch record (§3, §4.7).
pub struct LocalEpoch {
    /// 0 = no critical section in progress; otherwise the global epoch snapshotted on `enter`.
    snapshot: AtomicUsize,
    refcount: AtomicUsize,
    retire_queue: Mutex<Vec<Arc<Sink>>>,
    limbo: [Mutex<Vec<Arc<Sink>>>; 2],
    scan_index: AtomicUsize,
}

impl Default for LocalEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEpoch {
    pub fn new() -> Self {
        Self {
            snapshot: AtomicUsize::new(0),
            refcount: AtomicUsize::new(0),
            retire_queue: Mutex::new(Vec::new()),
            limbo: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            scan_index: AtomicUsize::new(0),
        }
    }

    /// Snapshot used by this listener's own bookkeeping in `advance`: 0 if it has nothing left
    /// to track, else the last epoch it folded/reclaimed limbo under.
    pub fn snapshot(&self) -> usize {
        self.snapshot.load(Ordering::Acquire)
    }

    /// True while this listener holds an open critical section. Exposed for observability only:
    /// `advance`'s scan gates on `snapshot()` against the current epoch, not on this, since a
    /// listener can be continuously pinned without ever holding a stale reference.
    pub fn is_pinned(&self) -> bool {
        self.refcount.load(Ordering::Acquire) > 0
    }

    /// Enters a critical section during which this listener may still be dereferencing a sink
    /// it observed before a close (§4.7 "Enter critical section").
    pub fn enter(&self, global: &GlobalEpoch) {
        self.snapshot.store(global.load(), Ordering::Relaxed);
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Exits the critical section; if this was the last reference, restores the "inactive"
    /// snapshot and, if something is queued, drives one `advance` pass.
    pub fn exit(&self, global: &GlobalEpoch, listeners: &[Arc<Listener>]) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.snapshot.store(0, Ordering::Release);
            if !self.retire_queue.lock().is_empty() {
                self.advance(global, listeners);
            }
        }
    }

    /// Pushes a closed sink onto this listener's retire queue (§4.7 "Retire a sink").
    pub fn retire(&self, sink: Arc<Sink>) {
        self.retire_queue.lock().push(sink);
    }

    /// Drives one step of the reclamation protocol (§4.7 "Advance"). Destroys any sinks that
    /// have survived two full epoch advances, folds newly retired sinks into the active limbo
    /// stack, and — if every listener has observed the current epoch — advances the global
    /// counter.
    ///
    /// `(g >> 1) & 1` toggles with every successful epoch advance, so it names two alternating
    /// "generations" rather than two fixed slots. A sink retired while this generation's bucket
    /// is `cur` must not be reclaimed until that bucket has cycled all the way around to being
    /// read back as `prev` — i.e. not in this call, but the one after the global epoch has moved
    /// again. Using the same index for both the reclaim read and the fold write within one call
    /// would destroy a sink one generation early relative to what it was folded under; reading
    /// `prev` and writing `cur` keeps a full generation of separation between the two.
    pub fn advance(&self, global: &GlobalEpoch, listeners: &[Arc<Listener>]) {
        let g = global.load();
        let local = self.snapshot.load(Ordering::Acquire);
        let cur = (g >> 1) & 1;
        let prev = cur ^ 1;

        if local != g {
            let reclaimable: Vec<Arc<Sink>> = std::mem::take(&mut self.limbo[prev].lock());
            for sink in reclaimable {
                sink.run_destroy();
            }
            let nothing_left = self.retire_queue.lock().is_empty()
                && self.limbo[0].lock().is_empty()
                && self.limbo[1].lock().is_empty();
            if nothing_left {
                self.snapshot.store(0, Ordering::Release);
                return;
            }
            self.snapshot.store(g, Ordering::Release);
            self.scan_index.store(0, Ordering::Relaxed);
        }

        let mut retire_queue = self.retire_queue.lock();
        if !retire_queue.is_empty() {
            self.limbo[cur].lock().extend(retire_queue.drain(..));
        }
        drop(retire_queue);

        // §4.7 "Advance": a listener blocks the scan only while its snapshot is neither `0`
        // (no open critical section) nor `g` (entered at or after the epoch this advance call
        // just observed) — i.e. `L'.e ∉ {0, G}`. A listener that is continuously busy
        // (back-to-back `enter`/`exit`, always pinned at whatever epoch happens to be current)
        // always snapshots the current `g` on its next `enter`, so it never blocks forever; only
        // a listener still holding a snapshot from a strictly earlier epoch — one that could
        // still be dereferencing a sink retired before that snapshot — blocks this scan.
        let start = self.scan_index.load(Ordering::Relaxed);
        let mut behind = 0usize;
        let mut all_observed = true;
        for (i, listener) in listeners.iter().enumerate().skip(start) {
            let e = listener.local_epoch().snapshot();
            if e != 0 && e != g {
                self.scan_index.store(i, Ordering::Relaxed);
                all_observed = false;
                behind += 1;
                if behind > GlobalEpoch::NUDGE_THRESHOLD {
                    listener.request_observe();
                }
                break;
            }
        }

        if all_observed {
            // Best-effort: if another listener already advanced it, that's fine too.
            let _ = global.0.compare_exchange(
                g,
                g + 2,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            tracing::debug!(epoch = g + 2, "epoch advanced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use std::sync::atomic::AtomicBool;

    fn make_listeners(n: usize) -> Vec<Arc<Listener>> {
        (0..n).map(|_| Arc::new(Listener::new().unwrap())).collect()
    }

    #[test]
    fn sink_destroyed_only_after_two_advances() {
        let global = GlobalEpoch::new();
        let listeners = make_listeners(1);
        let destroyed = Arc::new(AtomicBool::new(false));
        let d2 = destroyed.clone();
        let sink = Arc::new(Sink::new(1, crate::sink::SinkFlags::empty(), move || {
            d2.store(true, Ordering::SeqCst);
        }));

        let retiring = listeners[0].local_epoch();
        retiring.retire(sink);
        assert_eq!(global.load(), 1);

        retiring.advance(&global, &listeners);
        assert!(!destroyed.load(Ordering::SeqCst), "must not reclaim before G >= E+2");
        assert_eq!(global.load(), 3);

        retiring.advance(&global, &listeners);
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn pinned_at_the_current_epoch_does_not_stall_advance() {
        // A listener that is continuously busy (back-to-back `enter`/`exit`, always pinned at
        // whatever epoch happens to be current) must not block forever just for being pinned —
        // only a listener whose snapshot is a *stale* epoch (one retirement observed before it
        // last pinned) can still be holding a reference acquired before that retirement.
        let global = GlobalEpoch::new();
        let listeners = make_listeners(2);
        let sink = Arc::new(Sink::new(1, crate::sink::SinkFlags::empty(), || {}));

        listeners[1].local_epoch().enter(&global);
        listeners[0].local_epoch().retire(sink);
        listeners[0].local_epoch().advance(&global, &listeners);
        assert_eq!(global.load(), 3, "pinned at the epoch this retirement folded under, not a stale one");
    }

    #[test]
    fn advance_is_blocked_by_a_listener_pinned_since_an_earlier_epoch() {
        let global = GlobalEpoch::new();
        let listeners = make_listeners(2);

        // Listener 1 pins once, at epoch 1, and never exits -- a critical section that outlives
        // a full retire/advance cycle.
        listeners[1].local_epoch().enter(&global);

        let sink = Arc::new(Sink::new(1, crate::sink::SinkFlags::empty(), || {}));
        listeners[0].local_epoch().retire(sink);
        listeners[0].local_epoch().advance(&global, &listeners);
        // Listener 1 is pinned at epoch 1, the same epoch this retirement folded under, so it
        // doesn't block the transition out of the epoch it's already observing.
        assert_eq!(global.load(), 3, "a listener pinned at the current epoch must not block advance");

        // A second retirement tries to move the epoch again, to 5. Listener 1's snapshot (1) is
        // now stale relative to the current epoch (3), so this transition must stall.
        let sink2 = Arc::new(Sink::new(2, crate::sink::SinkFlags::empty(), || {}));
        listeners[0].local_epoch().retire(sink2);
        listeners[0].local_epoch().advance(&global, &listeners);
        assert_eq!(global.load(), 3, "listener 1's stale epoch-1 pin stalls the next transition");

        listeners[1].local_epoch().exit(&global, &listeners);
        listeners[0].local_epoch().advance(&global, &listeners);
        assert_eq!(global.load(), 5, "listener 1 no longer pinned, the transition proceeds");
    }
}
