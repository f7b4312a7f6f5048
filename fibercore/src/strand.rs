//! Fiber scheduler (component E, §4.5): one [`Strand`] per regular thread, running a stack of
//! stackful fibers cooperatively on top of [`fiber::Fiber`]'s raw stack-switching primitive.
//!
//! Fibers live in an arena (`Strand::slots`), indexed by [`FiberId`] rather than referenced by
//! raw pointer (§9's design notes steer away from intrusive pointer graphs for exactly this
//! pool). The run queue is the 32-priority bitmap structure §4.5 describes; `runq_get` finds the
//! highest-priority non-empty bin with a trailing-zero count the same way the source does.
//!
//! Cancellation delivery into a fiber's own call stack uses a forced-unwind panic carrying a
//! private sentinel type, the mechanism `libs/fiber`'s doc comments already attribute to
//! `corosensei`'s (commented-out) `force_unwind`. A thread-local "current suspend point" — the
//! same scoped-cell idiom used elsewhere in this codebase for other per-thread handles — lets
//! `yield_now`/`testcancel`/etc. be called from arbitrarily deep inside a fiber's own call stack
//! without threading a context parameter through every call.

use bitflags::bitflags;
use fiber::stack::DefaultFiberStack;
use fiber::{Fiber, FiberResult, Suspend};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Number of priority bins (§4.5: "32 priority bins indexed 0 (highest) to 31 (lowest)").
pub const PRIORITIES: usize = 32;
pub const DEFAULT_PRIORITY: u8 = 16;
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiberFlags: u32 {
        const CANCEL_DISABLE      = 1 << 0;
        const CANCEL_ASYNCHRONOUS = 1 << 1;
        const CANCEL_REQUIRED     = 1 << 2;
        const CANCEL_OCCURRED     = 1 << 3;
        const WAITING_FOR_EVENT   = 1 << 4;
        const COMBINING           = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Blocked,
    Pending,
    Running,
    Invalid,
}

/// Arena index into a [`Strand`]'s fiber pool. The generation guards against a stale id
/// referring to a slot that's since been recycled for a different fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

/// Why a fiber suspended itself.
enum Yielded {
    /// Cooperative `yield`: re-enqueue at the same priority.
    Yield,
    /// `block`: do not re-enqueue; an external `run` call is required.
    Block,
    /// `pause(deadline)`: do not re-enqueue; the strand's timeout wheel will `run` it.
    Pause(Instant),
}

/// How a fiber's start function finished.
#[derive(Debug)]
pub enum FiberExit {
    Value(i64),
    Canceled,
    /// The start function panicked with something other than our cancellation sentinel. Caught
    /// at the fiber boundary so one fiber's bug can't take down the whole strand.
    Panicked,
}

/// Fiber-local state reachable from inside the running fiber's own stack via
/// [`Fiber::fiber_local`].
#[derive(Default)]
struct FiberLocal {
    id: Cell<FiberId>,
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId { index: 0, generation: 0 }
    }
}

impl FiberId {
    /// Splits an id into its raw parts so it can be packed into an `AsyncCall`'s argument words
    /// for the cross-thread cancellation/wake path (§4.5 "routing through the owning context's
    /// async queue").
    pub fn into_raw(self) -> (u32, u32) {
        (self.index, self.generation)
    }

    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

type RawFiber = Fiber<(), Yielded, FiberExit, FiberLocal, DefaultFiberStack>;

/// Marker panic payload used to unwind a fiber's own call stack when it's canceled or exits
/// early via `strand::exit`. Never caught anywhere except the fiber entry trampoline.
struct Unwind(FiberExit);

/// A fiber's start function: receives its argument word and returns a result word, matching the
/// `(start function + argument)` record in §3 and the function-pointer style `TaskOps` already
/// uses.
pub type FiberFn = fn(usize) -> i64;

struct Slot {
    fiber: Option<RawFiber>,
    priority: Cell<u8>,
    state: Cell<FiberState>,
    flags: Cell<FiberFlags>,
    cleanup: RefCell<Vec<Box<dyn FnOnce() + Send>>>,
    result: RefCell<Option<FiberExit>>,
    generation: u32,
}

struct RunQueue {
    bitmap: u32,
    bins: [VecDeque<FiberId>; PRIORITIES],
}

impl RunQueue {
    fn new() -> Self {
        Self {
            bitmap: 0,
            bins: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn put(&mut self, id: FiberId, priority: u8) {
        let p = priority as usize;
        self.bins[p].push_back(id);
        self.bitmap |= 1 << p;
    }

    /// Pops the head of the highest-priority non-empty bin (§4.5: "count-trailing-zeros to find
    /// the highest-priority non-empty bin").
    fn get(&mut self) -> Option<FiberId> {
        if self.bitmap == 0 {
            return None;
        }
        let p = self.bitmap.trailing_zeros() as usize;
        let id = self.bins[p].pop_front()?;
        if self.bins[p].is_empty() {
            self.bitmap &= !(1 << p);
        }
        Some(id)
    }

    /// Removes a specific fiber from wherever it's queued, used by `hoist` to re-insert it at a
    /// new priority.
    fn remove(&mut self, id: FiberId, priority: u8) -> bool {
        let p = priority as usize;
        if let Some(pos) = self.bins[p].iter().position(|&x| x == id) {
            self.bins[p].remove(pos);
            if self.bins[p].is_empty() {
                self.bitmap &= !(1 << p);
            }
            true
        } else {
            false
        }
    }
}

#[derive(PartialEq, Eq)]
struct TimeoutEntry {
    deadline: Instant,
    fiber: FiberId,
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}
impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

thread_local! {
    /// The suspend point for whichever fiber is currently running on *this* thread. Only one
    /// fiber runs per strand at a time (§4.5 invariant), so a single scoped slot suffices; this
    /// mirrors the scoped thread-local pattern this codebase uses for other per-thread handles.
    static CURRENT_SUSPEND: Cell<*const Suspend<(), Yielded>> = const { Cell::new(ptr::null()) };
}

struct SuspendGuard(*const Suspend<(), Yielded>);
impl Drop for SuspendGuard {
    fn drop(&mut self) {
        CURRENT_SUSPEND.with(|c| c.set(self.0));
    }
}

fn with_current_suspend<R>(f: impl FnOnce(&Suspend<(), Yielded>) -> R) -> R {
    let ptr = CURRENT_SUSPEND.with(Cell::get);
    assert!(!ptr.is_null(), "called from outside a running fiber");
    // Safety: non-null only while the owning fiber body is installing it for the duration of
    // its own call (see `install_current_suspend`), which always outlives nested calls here.
    f(unsafe { &*ptr })
}

fn install_current_suspend<R>(suspend: &Suspend<(), Yielded>, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT_SUSPEND.with(Cell::get);
    CURRENT_SUSPEND.with(|c| c.set(suspend as *const _));
    let _guard = SuspendGuard(prev);
    f()
}

/// Per-thread fiber scheduler state (§3 "Strand").
pub struct Strand {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<u32>>,
    runq: RefCell<RunQueue>,
    current: Cell<Option<FiberId>>,
    timeouts: RefCell<BinaryHeap<Reverse<TimeoutEntry>>>,
    stack_size: usize,
}

impl Default for Strand {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

impl Strand {
    pub fn new(stack_size: usize) -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            runq: RefCell::new(RunQueue::new()),
            current: Cell::new(None),
            timeouts: RefCell::new(BinaryHeap::new()),
            stack_size,
        }
    }

    /// Creates a fiber running `start(arg)` at `priority`, enqueued immediately (§6
    /// `fiber_create`). The fiber occupies a freed arena slot if one is available.
    pub fn create(&self, start: FiberFn, arg: usize, priority: u8) -> Result<FiberId> {
        let stack = DefaultFiberStack::new(self.stack_size).map_err(Error::Io)?;
        let raw = RawFiber::with_stack(stack, move |_input: (), suspend, local: &FiberLocal| {
            install_current_suspend(suspend, || run_fiber_body(local.id.get(), start, arg))
        });

        let mut slots = self.slots.borrow_mut();
        let (index, generation) = if let Some(index) = self.free.borrow_mut().pop() {
            let gen = slots[index as usize].generation + 1;
            (index, gen)
        } else {
            (slots.len() as u32, 0)
        };
        let id = FiberId { index, generation };

        let slot = Slot {
            fiber: Some(raw),
            priority: Cell::new(priority),
            state: Cell::new(FiberState::Pending),
            flags: Cell::new(FiberFlags::empty()),
            cleanup: RefCell::new(Vec::new()),
            result: RefCell::new(None),
            generation,
        };
        if (index as usize) < slots.len() {
            slots[index as usize] = slot;
        } else {
            slots.push(slot);
        }
        drop(slots);

        self.set_fiber_local_id(id);
        self.runq.borrow_mut().put(id, priority);
        Ok(id)
    }

    fn set_fiber_local_id(&self, id: FiberId) {
        let slots = self.slots.borrow();
        let local = slots[id.index as usize].fiber.as_ref().unwrap().fiber_local();
        local.id.set(id);
    }

    fn slot(&self, id: FiberId) -> std::cell::Ref<'_, Slot> {
        std::cell::Ref::map(self.slots.borrow(), |s| &s[id.index as usize])
    }

    fn check_generation(&self, id: FiberId) {
        assert_eq!(
            self.slots.borrow()[id.index as usize].generation,
            id.generation,
            "stale FiberId referring to a recycled slot"
        );
    }

    pub fn state(&self, id: FiberId) -> FiberState {
        self.check_generation(id);
        self.slot(id).state.get()
    }

    pub fn current(&self) -> Option<FiberId> {
        self.current.get()
    }

    /// Runs the scheduler loop once: pops the highest-priority fiber and resumes it. Returns
    /// `false` if the run queue was empty (caller should drain the async queue / poll for I/O
    /// instead).
    pub fn run_once(&self) -> bool {
        let Some(id) = self.runq.borrow_mut().get() else {
            return false;
        };
        self.resume(id);
        true
    }

    fn resume(&self, id: FiberId) {
        self.check_generation(id);
        self.current.set(Some(id));
        self.slot(id).state.set(FiberState::Running);

        let result = {
            let mut slots = self.slots.borrow_mut();
            let fiber = slots[id.index as usize].fiber.as_mut().unwrap();
            fiber.resume(())
        };
        self.current.set(None);

        match result {
            FiberResult::Yield(Yielded::Yield) => {
                let priority = self.slot(id).priority.get();
                self.slot(id).state.set(FiberState::Pending);
                self.runq.borrow_mut().put(id, priority);
            }
            FiberResult::Yield(Yielded::Block) => {
                self.slot(id).state.set(FiberState::Blocked);
            }
            FiberResult::Yield(Yielded::Pause(deadline)) => {
                self.slot(id).state.set(FiberState::Blocked);
                self.timeouts
                    .borrow_mut()
                    .push(Reverse(TimeoutEntry { deadline, fiber: id }));
            }
            FiberResult::Return(exit) => {
                self.slot(id).state.set(FiberState::Invalid);
                *self.slot(id).result.borrow_mut() = Some(exit);
                self.free.borrow_mut().push(id.index);
            }
        }
    }

    /// Transitions `BLOCKED -> PENDING` and enqueues at the fiber's current priority (§4.5
    /// `run`). Cross-thread callers must instead route through the owning context's async queue
    /// — this method assumes it's called on the strand's own thread.
    pub fn run(&self, id: FiberId) {
        self.check_generation(id);
        if self.slot(id).state.get() != FiberState::Blocked {
            return;
        }
        let priority = self.slot(id).priority.get();
        self.slot(id).state.set(FiberState::Pending);
        self.runq.borrow_mut().put(id, priority);
    }

    /// Temporarily boosts `id`'s priority, moving it within the run queue if it's currently
    /// waiting there (§4.5 `hoist`).
    pub fn hoist(&self, id: FiberId, priority: u8) {
        self.check_generation(id);
        let old = self.slot(id).priority.get();
        if old == priority {
            return;
        }
        if self.slot(id).state.get() == FiberState::Pending
            && self.runq.borrow_mut().remove(id, old)
        {
            self.runq.borrow_mut().put(id, priority);
        }
        self.slot(id).priority.set(priority);
    }

    /// Runs any fiber whose `pause` deadline has elapsed. Called once per scheduler tick by the
    /// owning context, alongside its clock refresh.
    pub fn expire_timeouts(&self, now: Instant) {
        loop {
            let due = matches!(self.timeouts.borrow().peek(), Some(Reverse(e)) if e.deadline <= now);
            if !due {
                break;
            }
            let Reverse(entry) = self.timeouts.borrow_mut().pop().unwrap();
            self.run(entry.fiber);
        }
    }

    pub fn result(&self, id: FiberId) -> Option<FiberExit> {
        self.slot(id).result.borrow_mut().take()
    }

    pub fn set_cancel_state(&self, id: FiberId, disable: bool) {
        self.check_generation(id);
        let mut flags = self.slot(id).flags.get();
        flags.set(FiberFlags::CANCEL_DISABLE, disable);
        self.slot(id).flags.set(flags);
    }

    pub fn set_cancel_type(&self, id: FiberId, asynchronous: bool) {
        self.check_generation(id);
        let mut flags = self.slot(id).flags.get();
        flags.set(FiberFlags::CANCEL_ASYNCHRONOUS, asynchronous);
        self.slot(id).flags.set(flags);
    }

    /// Sets `CANCEL_REQUIRED` on `id` (§4.5). Must be called on the strand's own thread; a
    /// cross-thread caller routes this through an async call to the owning context first.
    pub fn cancel(&self, id: FiberId) {
        self.check_generation(id);
        let mut flags = self.slot(id).flags.get();
        flags.insert(FiberFlags::CANCEL_REQUIRED);
        self.slot(id).flags.set(flags);
        // Asynchronous cancellation may preempt at any point, not just the next explicit test
        // point, but we still only deliver it on this thread's next resume of `id` — there is no
        // true preemption in this runtime (spec.md §1 Non-goals).
        if self.slot(id).state.get() == FiberState::Blocked
            && flags.contains(FiberFlags::CANCEL_ASYNCHRONOUS)
        {
            self.run(id);
        }
    }

    pub fn cleanup_push(&self, id: FiberId, handler: impl FnOnce() + Send + 'static) {
        self.check_generation(id);
        self.slot(id).cleanup.borrow_mut().push(Box::new(handler));
    }

    pub fn cleanup_pop(&self, id: FiberId, execute: bool) {
        self.check_generation(id);
        if let Some(handler) = self.slot(id).cleanup.borrow_mut().pop() {
            if execute {
                handler();
            }
        }
    }

    fn cancel_requested(&self, id: FiberId) -> bool {
        let flags = self.slot(id).flags.get();
        flags.contains(FiberFlags::CANCEL_REQUIRED) && !flags.contains(FiberFlags::CANCEL_DISABLE)
    }

    fn run_all_cleanup(&self, id: FiberId) {
        loop {
            let handler = self.slot(id).cleanup.borrow_mut().pop();
            match handler {
                Some(h) => h(),
                None => break,
            }
        }
    }
}

/// Runs the user start function on the freshly-switched-to fiber stack, installing the
/// cancellation/exit unwind boundary (§4.5 `exit`, cancellation).
fn run_fiber_body(id: FiberId, start: FiberFn, arg: usize) -> FiberExit {
    let outcome = catch_unwind(AssertUnwindSafe(|| start(arg)));
    match outcome {
        Ok(value) => {
            with_strand(|s| s.run_all_cleanup(id));
            FiberExit::Value(value)
        }
        Err(payload) => {
            with_strand(|s| s.run_all_cleanup(id));
            match payload.downcast::<Unwind>() {
                Ok(unwind) => unwind.0,
                Err(_) => FiberExit::Panicked,
            }
        }
    }
}

thread_local! {
    static OWNING_STRAND: Cell<*const Strand> = const { Cell::new(ptr::null()) };
}

/// Binds `strand` as the one whose fibers are currently being resumed on this thread. Must be
/// called by the owning context before running its scheduler loop, and outlives every fiber
/// resume on this thread.
pub fn bind_strand(strand: &Strand, f: impl FnOnce()) {
    let prev = OWNING_STRAND.with(Cell::get);
    OWNING_STRAND.with(|c| c.set(strand as *const _));
    f();
    OWNING_STRAND.with(|c| c.set(prev));
}

fn with_strand<R>(f: impl FnOnce(&Strand) -> R) -> R {
    let ptr = OWNING_STRAND.with(Cell::get);
    assert!(!ptr.is_null(), "no strand bound on this thread");
    // Safety: `bind_strand` keeps the pointer valid for the duration of every fiber resume
    // performed on this thread.
    f(unsafe { &*ptr })
}

/// Cooperatively yields the calling fiber back to its strand's scheduler (§4.5 `yield`).
pub fn yield_now() {
    testcancel();
    with_current_suspend(|s| s.suspend(Yielded::Yield));
    testcancel();
}

/// Suspends the calling fiber without re-enqueuing it; some other fiber or thread must call
/// `Strand::run` on it later (§4.5 `block`).
pub fn block() {
    testcancel();
    with_current_suspend(|s| s.suspend(Yielded::Block));
    testcancel();
}

/// Suspends the calling fiber until `deadline` or until woken by `Strand::run` (§4.5 `pause`).
pub fn pause(timeout: Duration) {
    let deadline = Instant::now() + timeout;
    testcancel();
    with_current_suspend(|s| s.suspend(Yielded::Pause(deadline)));
    testcancel();
}

/// Checks for a pending cancellation request and, if found (and not disabled), unwinds the
/// calling fiber's stack back to its entry point (§4.5 cancellation, §5).
pub fn testcancel() {
    let id = with_strand(|s| s.current()).expect("testcancel called outside a fiber");
    let should_cancel = with_strand(|s| s.cancel_requested(id));
    if should_cancel {
        let mut flags = with_strand(|s| s.slot(id).flags.get());
        flags.insert(FiberFlags::CANCEL_OCCURRED);
        with_strand(|s| s.slot(id).flags.set(flags));
        std::panic::panic_any(Unwind(FiberExit::Canceled));
    }
}

/// Ends the calling fiber immediately with `value`, running cleanup handlers in LIFO order
/// (§4.5 `exit`). Never returns.
pub fn exit(value: i64) -> ! {
    std::panic::panic_any(Unwind(FiberExit::Value(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    fn with_test_strand(f: impl FnOnce(&Strand)) {
        let strand = Strand::new(64 * 1024);
        bind_strand(&strand, || f(&strand));
    }

    #[test]
    fn run_once_drains_highest_priority_first() {
        static ORDER: AtomicU32 = AtomicU32::new(0);
        static SEEN: std::sync::Mutex<Vec<u8>> = std::sync::Mutex::new(Vec::new());

        fn body(priority: usize) -> i64 {
            SEEN.lock().unwrap().push(priority as u8);
            0
        }
        fn body_lo(_: usize) -> i64 {
            body(31)
        }
        fn body_hi(_: usize) -> i64 {
            body(0)
        }

        with_test_strand(|strand| {
            strand.create(body_lo, 0, 31).unwrap();
            strand.create(body_hi, 0, 0).unwrap();
            while strand.run_once() {}
        });

        assert_eq!(*SEEN.lock().unwrap(), vec![0, 31]);
        let _ = ORDER;
    }

    #[test]
    fn yield_then_yield_round_robins() {
        static LOG: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());

        fn fiber_a(_: usize) -> i64 {
            LOG.lock().unwrap().push("a1");
            yield_now();
            LOG.lock().unwrap().push("a2");
            0
        }
        fn fiber_b(_: usize) -> i64 {
            LOG.lock().unwrap().push("b1");
            yield_now();
            LOG.lock().unwrap().push("b2");
            0
        }

        with_test_strand(|strand| {
            strand.create(fiber_a, 0, 10).unwrap();
            strand.create(fiber_b, 0, 10).unwrap();
            for _ in 0..4 {
                strand.run_once();
            }
        });

        assert_eq!(*LOG.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn cancel_unwinds_and_runs_cleanup_in_lifo_order() {
        static RESULT: AtomicI64 = AtomicI64::new(-1);
        static CLEANUP_ORDER: std::sync::Mutex<Vec<u8>> = std::sync::Mutex::new(Vec::new());

        fn waits(_: usize) -> i64 {
            let id = with_strand(|s| s.current()).unwrap();
            with_strand(|s| {
                s.cleanup_push(id, || CLEANUP_ORDER.lock().unwrap().push(1));
                s.cleanup_push(id, || CLEANUP_ORDER.lock().unwrap().push(2));
            });
            block();
            unreachable!("canceled before being run() again");
        }

        with_test_strand(|strand| {
            let id = strand.create(waits, 0, 10).unwrap();
            strand.run_once(); // parks in Block
            strand.cancel(id);
            strand.run(id); // drive it past the cancel test point
            strand.run_once();
            match strand.result(id) {
                Some(FiberExit::Canceled) => RESULT.store(1, Ordering::SeqCst),
                other => panic!("unexpected exit: {other:?}"),
            }
        });

        assert_eq!(RESULT.load(Ordering::SeqCst), 1);
        assert_eq!(*CLEANUP_ORDER.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn hoist_reprioritizes_a_queued_fiber() {
        fn noop(_: usize) -> i64 {
            0
        }
        with_test_strand(|strand| {
            let id = strand.create(noop, 0, 20).unwrap();
            strand.hoist(id, 2);
            // The fiber should now be the only (and thus first) one in bin 2.
            assert!(strand.run_once());
        });
    }
}
