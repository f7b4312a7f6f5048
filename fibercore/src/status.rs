//! The packed context/listener status word (§3, §4.6).
//!
//! Two low bits hold a [`Kind`]; the remaining bits hold a snapshot of the async queue's
//! dequeue stamp at the moment the owning thread parked. The listener state machine in
//! [`crate::listener`] is driven by the same atomic word as the owning context's status — there
//! is exactly one word per context, not two.

use std::sync::atomic::{AtomicUsize, Ordering};

const KIND_BITS: u32 = 2;
const KIND_MASK: usize = 0b11;

/// One of the four states a context (and its listener) can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Kind {
    /// Executing fibers or draining the async queue.
    Running = 0,
    /// Work arrived; the next park attempt must be skipped.
    Pending = 1,
    /// Blocked inside the kernel event call.
    Polling = 2,
    /// Blocked on a timed wait.
    Waiting = 3,
}

impl Kind {
    #[inline]
    fn from_bits(bits: usize) -> Self {
        match bits {
            0 => Kind::Running,
            1 => Kind::Pending,
            2 => Kind::Polling,
            _ => Kind::Waiting,
        }
    }
}

/// The packed `(Kind, stamp)` atomic word.
#[derive(Debug)]
pub struct StatusWord(AtomicUsize);

impl Default for StatusWord {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWord {
    pub fn new() -> Self {
        Self(AtomicUsize::new(Kind::Running as usize))
    }

    #[inline]
    fn pack(kind: Kind, stamp: usize) -> usize {
        (stamp << KIND_BITS) | kind as usize
    }

    /// Current `(kind, stamp)` snapshot.
    pub fn load(&self, order: Ordering) -> (Kind, usize) {
        let v = self.0.load(order);
        (Kind::from_bits(v & KIND_MASK), v >> KIND_BITS)
    }

    /// Attempts `RUNNING -> POLLING | (stamp << 2)`. Fails (returns `false`) if a post already
    /// raced this thread to `PENDING` in the meantime, in which case the caller must not park.
    pub fn try_enter_poll(&self, stamp: usize) -> bool {
        self.try_enter_parked(Kind::Polling, stamp)
    }

    /// Attempts `RUNNING -> WAITING | (stamp << 2)`, used by `pause`.
    pub fn try_enter_wait(&self, stamp: usize) -> bool {
        self.try_enter_parked(Kind::Waiting, stamp)
    }

    fn try_enter_parked(&self, kind: Kind, stamp: usize) -> bool {
        debug_assert!(matches!(kind, Kind::Polling | Kind::Waiting));
        self.0
            .compare_exchange(
                Kind::Running as usize,
                Self::pack(kind, stamp),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Clears to `RUNNING`, dropping any parked stamp. Only the owning thread calls this.
    pub fn begin_running(&self) {
        self.0.store(Kind::Running as usize, Ordering::Release);
    }

    /// Called by a poster after an enqueue returned `enqueue_stamp`. If this context was parked
    /// (`POLLING`/`WAITING`) with an embedded stamp `<= enqueue_stamp`, transitions it to
    /// `PENDING` and reports that the caller must write the notify fd. Returns `false` if the
    /// context was already `RUNNING` or `PENDING`, or if its parked stamp is newer than this
    /// post (it already observed a later drain).
    pub fn notify(&self, enqueue_stamp: usize) -> bool {
        loop {
            let v = self.0.load(Ordering::Acquire);
            let kind = Kind::from_bits(v & KIND_MASK);
            let embedded = v >> KIND_BITS;
            match kind {
                Kind::Polling | Kind::Waiting if embedded <= enqueue_stamp => {
                    if self
                        .0
                        .compare_exchange_weak(
                            v,
                            Kind::Pending as usize,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_poll_then_notify_wakes() {
        let s = StatusWord::new();
        assert!(s.try_enter_poll(5));
        assert_eq!(s.load(Ordering::Acquire).0, Kind::Polling);
        assert!(s.notify(10));
        assert_eq!(s.load(Ordering::Acquire).0, Kind::Pending);
    }

    #[test]
    fn notify_with_stale_stamp_is_ignored() {
        let s = StatusWord::new();
        assert!(s.try_enter_poll(10));
        assert!(!s.notify(3));
        assert_eq!(s.load(Ordering::Acquire).0, Kind::Polling);
    }

    #[test]
    fn enter_poll_fails_if_already_pending() {
        let s = StatusWord::new();
        s.0.store(Kind::Pending as usize, Ordering::Release);
        assert!(!s.try_enter_poll(0));
    }

    #[test]
    fn begin_running_clears_parked_stamp() {
        let s = StatusWord::new();
        s.try_enter_poll(42);
        s.begin_running();
        assert_eq!(s.load(Ordering::Acquire), (Kind::Running, 0));
    }
}
