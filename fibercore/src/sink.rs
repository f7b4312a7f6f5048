//! Event sinks (component F's per-fd record, §3): a registered file descriptor plus flags,
//! at most one blocked fiber per side, and the bookkeeping the dispatcher and epoch
//! reclamation layer need to hand it between listeners and eventually destroy it.
//!
//! A sink is always reached through `Arc<Sink>` — the reclamation limbo stacks (§4.7) and the
//! dispatcher's per-listener registration table both hold clones of the same handle rather than
//! an intrusive link, per the arena/handle style the rest of this crate uses instead of raw
//! pointer graphs.

use crate::strand::FiberId;
use crate::tasks::Task;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

bitflags! {
    /// §3's flag bitmap. A `REGULAR_*` side keeps reporting readiness on every poll; a
    /// `ONESHOT_*` side is armed once and must be explicitly rearmed (`Listener::rearm`) after
    /// each event it delivers, per §4.6's "a oneshot-input sink rearms after each event." A side
    /// with neither bit set is never armed with the backend at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SinkFlags: u32 {
        const REGULAR_INPUT  = 1 << 0;
        const REGULAR_OUTPUT = 1 << 1;
        const INPUT_READY    = 1 << 2;
        const OUTPUT_READY   = 1 << 3;
        const INPUT_CLOSED   = 1 << 4;
        const OUTPUT_CLOSED  = 1 << 5;
        const FIXED_POLLER   = 1 << 6;
        const INPUT_ERROR    = 1 << 7;
        const OUTPUT_ERROR   = 1 << 8;
        const ONESHOT_INPUT  = 1 << 9;
        const ONESHOT_OUTPUT = 1 << 10;
    }
}

/// No listener has claimed this sink yet (only possible for non-fixed sinks between
/// registration and assignment).
pub const NO_LISTENER: usize = usize::MAX;

/// What's waiting on one side of a sink: a blocked fiber to resume, a task to append, or
/// nobody yet. Mirrors the "I/O vtable shared with peer sinks of the same kind" (§3): sinks of
/// the same kind agree out of band on which arm they use.
pub enum Waiter {
    None,
    Fiber(FiberId),
    Task(Task),
}

struct Waiters {
    input: Waiter,
    output: Waiter,
}

pub struct Sink {
    pub fd: RawFd,
    flags: AtomicU32,
    /// Index of the owning listener within the dispatcher's context table, or [`NO_LISTENER`].
    /// Fixed-poller sinks are assigned this at registration and it never changes; reassignable
    /// sinks are assigned by the dispatcher's balancer and may move across an epoch boundary
    /// (§3 invariant: never while still referenced).
    listener: AtomicUsize,
    waiters: Mutex<Waiters>,
    destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// Safety: `waiters`/`destroy` are behind `Mutex`; `flags`/`listener` are atomics. The `FnOnce`
// inside `destroy` is required `Send` by `Sink::new`.
unsafe impl Send for Sink {}
unsafe impl Sync for Sink {}

impl Sink {
    pub fn new(fd: RawFd, flags: SinkFlags, destroy: impl FnOnce() + Send + 'static) -> Self {
        let listener = if flags.contains(SinkFlags::FIXED_POLLER) {
            0
        } else {
            NO_LISTENER
        };
        Self {
            fd,
            flags: AtomicU32::new(flags.bits()),
            listener: AtomicUsize::new(listener),
            waiters: Mutex::new(Waiters {
                input: Waiter::None,
                output: Waiter::None,
            }),
            destroy: Mutex::new(Some(Box::new(destroy))),
        }
    }

    pub fn flags(&self) -> SinkFlags {
        SinkFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, flag: SinkFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: SinkFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn set_ready_input(&self) {
        self.set_flag(SinkFlags::INPUT_READY);
    }

    pub fn set_ready_output(&self) {
        self.set_flag(SinkFlags::OUTPUT_READY);
    }

    pub fn set_error(&self) {
        self.set_flag(SinkFlags::INPUT_ERROR | SinkFlags::OUTPUT_ERROR);
    }

    /// Closes one side (§4.6 "Closing a sink"): sets the closed flag and clears the ready flag,
    /// returning any waiter so the caller can wake a blocked fiber or run a pending task with a
    /// `Closed` result.
    pub fn close_input(&self) -> Waiter {
        self.set_flag(SinkFlags::INPUT_CLOSED);
        self.clear_flag(SinkFlags::INPUT_READY);
        std::mem::replace(&mut self.waiters.lock().input, Waiter::None)
    }

    pub fn close_output(&self) -> Waiter {
        self.set_flag(SinkFlags::OUTPUT_CLOSED);
        self.clear_flag(SinkFlags::OUTPUT_READY);
        std::mem::replace(&mut self.waiters.lock().output, Waiter::None)
    }

    pub fn is_closed(&self) -> bool {
        self.flags()
            .contains(SinkFlags::INPUT_CLOSED | SinkFlags::OUTPUT_CLOSED)
    }

    /// Records (at most one) waiter per side, per the §3 invariant. Returns the previous waiter,
    /// which should be `Waiter::None` in a correct caller — two fibers blocking on the same side
    /// simultaneously is a programming error in the caller, not something this type enforces.
    pub fn set_input_waiter(&self, waiter: Waiter) -> Waiter {
        std::mem::replace(&mut self.waiters.lock().input, waiter)
    }

    pub fn set_output_waiter(&self, waiter: Waiter) -> Waiter {
        std::mem::replace(&mut self.waiters.lock().output, waiter)
    }

    pub fn take_input_waiter(&self) -> Waiter {
        std::mem::replace(&mut self.waiters.lock().input, Waiter::None)
    }

    pub fn take_output_waiter(&self) -> Waiter {
        std::mem::replace(&mut self.waiters.lock().output, Waiter::None)
    }

    pub fn listener(&self) -> Option<usize> {
        match self.listener.load(Ordering::Acquire) {
            NO_LISTENER => None,
            idx => Some(idx),
        }
    }

    /// Claims ownership for `idx` via a release-store CAS from [`NO_LISTENER`] (§4.6: "claims
    /// ownership by writing `sink.listener` via release store"). Returns `false` if another
    /// listener already claimed it first.
    pub fn try_claim_listener(&self, idx: usize) -> bool {
        self.listener
            .compare_exchange(NO_LISTENER, idx, Ordering::Release, Ordering::Acquire)
            .is_ok()
    }

    /// Runs the destroy callback exactly once. Called by epoch reclamation once no listener can
    /// still reference this sink (§4.7), on the sink's owning strand.
    pub fn run_destroy(&self) {
        if let Some(destroy) = self.destroy.lock().take() {
            destroy();
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("fd", &self.fd)
            .field("flags", &self.flags())
            .field("listener", &self.listener.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn fixed_poller_is_preassigned() {
        let sink = Sink::new(3, SinkFlags::FIXED_POLLER, || {});
        assert_eq!(sink.listener(), Some(0));
        assert!(!sink.try_claim_listener(1));
    }

    #[test]
    fn reassignable_sink_is_claimed_once() {
        let sink = Sink::new(3, SinkFlags::REGULAR_INPUT, || {});
        assert_eq!(sink.listener(), None);
        assert!(sink.try_claim_listener(2));
        assert_eq!(sink.listener(), Some(2));
        assert!(!sink.try_claim_listener(5));
    }

    #[test]
    fn close_clears_ready_and_returns_waiter() {
        let sink = Sink::new(3, SinkFlags::REGULAR_INPUT, || {});
        sink.set_ready_input();
        assert!(sink.set_input_waiter(Waiter::None).type_is_none());
        let closed = sink.close_input();
        assert!(closed.type_is_none());
        assert!(sink.flags().contains(SinkFlags::INPUT_CLOSED));
        assert!(!sink.flags().contains(SinkFlags::INPUT_READY));
    }

    #[test]
    fn destroy_runs_exactly_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let sink = Sink::new(3, SinkFlags::empty(), move || {
            assert!(!ran2.swap(true, Ordering::SeqCst));
        });
        sink.run_destroy();
        sink.run_destroy();
        assert!(ran.load(Ordering::SeqCst));
    }

    impl Waiter {
        fn type_is_none(&self) -> bool {
            matches!(self, Waiter::None)
        }
    }
}
