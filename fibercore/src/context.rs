//! Execution context (component C, §3, §4.3): the per-thread bundle of everything that thread
//! owns — its async call queue, task list, memory cache, fiber scheduler, and event listener —
//! plus the glue that drives one scheduler tick and routes cross-thread operations through the
//! async queue rather than touching another thread's state directly.

use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::epoch::GlobalEpoch;
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::queue::{AsyncCall, AsyncFn, AsyncQueue, MAX_ARGS, enqueue_with_backoff};
use crate::sink::{Sink, SinkFlags, Waiter};
use crate::status::StatusWord;
use crate::strand::{FiberFn, FiberId, Strand};
use crate::tasks::{REQUEST_THRESHOLD, Task, TaskList};

/// Above this many queued tasks, a context is considered overloaded and will both refuse to ask
/// peers for work and proactively push its surplus to an underloaded one. Not named in
/// `tasks.rs` because it's a cross-context comparison, not a property of one list — it lives
/// here, next to the policy driver that uses it.
pub const DISTRIBUTE_THRESHOLD: usize = 3 * REQUEST_THRESHOLD;

/// Per-thread execution context. Always held behind `Arc` once constructed, since the async
/// queue, task list, and cache are all meant to be reachable from peer threads; only `strand`
/// (the fiber scheduler) is confined to the owning thread.
pub struct Context {
    id: usize,
    status: StatusWord,
    queue: AsyncQueue,
    tasks: Mutex<TaskList>,
    cache: Mutex<cache::Cache>,
    listener: Arc<Listener>,
    strand: Strand,
    clock: Clock,
    global_epoch: Arc<GlobalEpoch>,
    peers: std::sync::OnceLock<Vec<Arc<Context>>>,
    shutdown: AtomicBool,
}

// Safety: every field except `strand` is already `Send + Sync` on its own (atomics, or types
// behind a `parking_lot::Mutex`/`OnceLock`). `strand` holds fiber stacks that assume they're
// only ever resumed by the thread that created them; every other field reaches `strand`'s
// owner only indirectly, through the async queue, the task list's mutex, or the listener's
// notify channel — the same pattern `Sink` already uses for its own cross-thread handle.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new(
        id: usize,
        queue_capacity: usize,
        stack_size: usize,
        listener: Listener,
        global_epoch: Arc<GlobalEpoch>,
    ) -> Self {
        Self {
            id,
            status: StatusWord::new(),
            queue: AsyncQueue::new(queue_capacity),
            tasks: Mutex::new(TaskList::new()),
            cache: Mutex::new(cache::Cache::new()),
            listener: Arc::new(listener),
            strand: Strand::new(stack_size),
            clock: Clock::new(),
            global_epoch,
            peers: std::sync::OnceLock::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> &StatusWord {
        &self.status
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn tasks(&self) -> &Mutex<TaskList> {
        &self.tasks
    }

    pub fn cache(&self) -> &Mutex<cache::Cache> {
        &self.cache
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Set exactly once, before any worker thread starts its run loop (see
    /// `bootstrap::Runtime::start`). Later calls are ignored — the peer group never changes
    /// shape after bootstrap, matching spec.md's lack of a "join a running dispatcher" operation.
    pub(crate) fn set_peers(&self, peers: Vec<Arc<Context>>) {
        let _ = self.peers.set(peers);
    }

    pub fn peers(&self) -> &[Arc<Context>] {
        self.peers.get().map_or(&[], Vec::as_slice)
    }

    /// The listeners of every context in this one's peer group, including its own — what
    /// `LocalEpoch::advance` needs to decide whether every listener has observed an epoch.
    fn peer_listeners(&self) -> Vec<Arc<Listener>> {
        self.peers().iter().map(|c| c.listener.clone()).collect()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn wake_if_parked(&self, stamp: usize) {
        if self.status.notify(stamp) {
            self.listener.notify();
        }
    }

    /// Targets a specific peer context (§4.3 `call`): enqueues on `target`'s queue, retrying
    /// with escalating backoff if it's momentarily full, then wakes `target` if it was parked.
    pub fn call(&self, target: &Context, func: AsyncFn, args: [usize; MAX_ARGS]) {
        let stamp = match target.queue.try_enqueue(AsyncCall::new(func, args)) {
            Ok(stamp) => stamp,
            Err(call) => enqueue_with_backoff(&target.queue, call, "context::call"),
        };
        target.wake_if_parked(stamp);
    }

    /// Same as [`Context::call`] but built from a variable-length argument slice (covers the
    /// `async_call_0`..`async_call_6` table spec.md §6 describes — `AsyncCall` already caps at
    /// `MAX_ARGS` words, so one slice-taking function serves every arity instead of six
    /// near-duplicate ones).
    pub fn call_with(&self, target: &Context, func: AsyncFn, args: &[usize]) {
        self.call(target, func, pack_args(args));
    }

    /// Picks any eligible peer and enqueues on it (§4.3 `post`: "the first peer not in `RUNNING`,
    /// else any peer, else direct-call locally"). Scans peers twice so an idle peer later in the
    /// list is preferred over a busy one earlier in it; if every peer's queue is momentarily
    /// full on both passes, falls back to running `func` inline on the calling thread rather
    /// than blocking.
    pub fn post(&self, func: AsyncFn, args: [usize; MAX_ARGS]) {
        let not_running = self
            .peers()
            .iter()
            .filter(|p| !std::ptr::eq(p.as_ref(), self))
            .filter(|p| p.status.load(Ordering::Acquire).0 != crate::status::Kind::Running);
        for peer in not_running {
            if let Ok(stamp) = peer.queue.try_enqueue(AsyncCall::new(func, args)) {
                peer.wake_if_parked(stamp);
                return;
            }
        }
        for peer in self.peers() {
            if std::ptr::eq(peer.as_ref(), self) {
                continue;
            }
            if let Ok(stamp) = peer.queue.try_enqueue(AsyncCall::new(func, args)) {
                peer.wake_if_parked(stamp);
                return;
            }
        }
        func(self, &args);
    }

    pub fn post_with(&self, func: AsyncFn, args: &[usize]) {
        self.post(func, pack_args(args));
    }

    /// Creates a fiber on this context's own strand (§4.5 `fiber_create`). Must be called from
    /// the thread that owns this context.
    pub fn spawn_fiber(&self, start: FiberFn, arg: usize, priority: u8) -> Result<FiberId> {
        self.strand.create(start, arg, priority)
    }

    /// Requests cancellation of `fiber`, owned by `owner` (possibly a different thread's
    /// context). Routed through an async call so the actual flag flip and any forced unwind
    /// happen only on `owner`'s own thread (§4.5, §9: cross-thread cancellation is fully
    /// implemented this way rather than left `UNSUPPORTED`).
    pub fn cancel_fiber(&self, owner: &Context, fiber: FiberId) {
        let (index, generation) = fiber.into_raw();
        self.call(owner, do_cancel_fiber, [index as usize, generation as usize, 0, 0, 0, 0]);
    }

    /// Registers `fd` as an event sink on this context's own listener (§6 "Sink registration").
    /// Fixed-poller sinks are pinned to listener index 0, matching `Sink::new`'s own
    /// pre-assignment; reassignable sinks claim this context's index immediately, since this
    /// crate ships the claim primitive but not a dispatcher-level balancer that would hand a
    /// freshly registered fd to whichever listener is least loaded (see DESIGN.md's Open
    /// Question on listener ownership). A caller that wants balanced placement can still move a
    /// sink later by having another context call `try_claim_listener` before this one binds it.
    pub fn register_sink(
        &self,
        fd: RawFd,
        flags: SinkFlags,
        destroy: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Sink>> {
        let sink = Arc::new(Sink::new(fd, flags, destroy));
        let idx = if flags.contains(SinkFlags::FIXED_POLLER) { 0 } else { self.id };
        sink.try_claim_listener(idx);
        self.listener.bind(sink.clone()).map_err(Error::Io)?;
        Ok(sink)
    }

    /// Closes both sides of `sink` (§4.6 "Closing a sink"): wakes whichever fiber or task was
    /// waiting on either side, deregisters it from this context's listener, and retires it into
    /// epoch reclamation (§4.7) so `sink`'s destroy callback runs only once no listener can
    /// still be dereferencing it.
    pub fn close_sink(&self, sink: &Arc<Sink>) {
        for waiter in [sink.close_input(), sink.close_output()] {
            match waiter {
                Waiter::Fiber(id) => self.strand.run(id),
                Waiter::Task(task) => self.tasks.lock().append(task),
                Waiter::None => {}
            }
        }
        if let Some(removed) = self.listener.unbind(sink.fd) {
            self.listener.local_epoch().retire(removed);
        }
    }

    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        Ok(self.cache.lock().alloc(size)?)
    }

    pub fn zalloc(&self, size: usize) -> Result<NonNull<u8>> {
        Ok(self.cache.lock().zalloc(size)?)
    }

    pub fn aligned_alloc(&self, align: usize, size: usize) -> Result<NonNull<u8>> {
        Ok(self.cache.lock().aligned_alloc(align, size)?)
    }

    pub fn calloc(&self, n: usize, size: usize) -> Result<NonNull<u8>> {
        Ok(self.cache.lock().calloc(n, size)?)
    }

    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        Ok(self.cache.lock().realloc(ptr, new_size)?)
    }

    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        Ok(self.cache.lock().free(ptr)?)
    }

    pub fn remote_free_handle(&self, ptr: NonNull<u8>) -> Option<cache::RemoteFreeHandle> {
        self.cache.lock().remote_free_handle(ptr)
    }

    /// The load-balancing policy driver spec.md §4.4 describes but doesn't give a home to: if
    /// this context is under [`tasks::REQUEST_THRESHOLD`](crate::tasks::REQUEST_THRESHOLD) and
    /// doesn't already have a request in flight, asks the most-loaded peer above
    /// [`DISTRIBUTE_THRESHOLD`] for work; if it's above `DISTRIBUTE_THRESHOLD` itself, proactively
    /// pushes its surplus to the least-loaded peer. At most one action per call, matching the
    /// "single in-flight reassign request" rule.
    pub fn balance_tasks(&self) {
        let my_len = self.tasks.lock().len();

        if my_len < REQUEST_THRESHOLD {
            if self.tasks.lock().request_in_progress() {
                return;
            }
            let overloaded = self
                .peers()
                .iter()
                .filter(|p| !std::ptr::eq(p.as_ref(), self))
                .max_by_key(|p| p.tasks.lock().len())
                .filter(|p| p.tasks.lock().len() > DISTRIBUTE_THRESHOLD);
            if let Some(peer) = overloaded {
                let mut tasks = self.tasks.lock();
                tasks.set_request_in_progress(true);
                tasks.record_request_sent();
                drop(tasks);
                self.call(peer, request_tasks, [self as *const Context as usize, 0, 0, 0, 0, 0]);
            }
        } else if my_len > DISTRIBUTE_THRESHOLD {
            let underloaded = self
                .peers()
                .iter()
                .filter(|p| !std::ptr::eq(p.as_ref(), self))
                .min_by_key(|p| p.tasks.lock().len())
                .filter(|p| p.tasks.lock().len() < REQUEST_THRESHOLD);
            if let Some(peer) = underloaded {
                let mut tasks = self.tasks.lock();
                tasks.reassign_to_peer(peer, |call| self.call(peer, call.func, call.args));
            }
        }
    }

    /// Runs one pass of the scheduler loop: refreshes the clock, fires any elapsed `pause`
    /// timers, drains the async queue, collects freed remote pointers, balances the task list
    /// against peers, executes pending tasks, runs every currently-runnable fiber to
    /// exhaustion, drives one epoch-reclamation step, and finally polls for I/O (blocking only
    /// if there is truly nothing else to do).
    pub fn run_tick(&self) {
        self.clock.tick();
        self.strand.expire_timeouts(Instant::now());
        self.queue.drain(self);
        self.cache.lock().cache_collect();
        self.balance_tasks();
        self.tasks.lock().execute_all();

        let mut ran_a_fiber = false;
        crate::strand::bind_strand(&self.strand, || {
            while self.strand.run_once() {
                ran_a_fiber = true;
            }
        });

        self.listener
            .local_epoch()
            .advance(&self.global_epoch, &self.peer_listeners());

        let idle = !ran_a_fiber && self.tasks.lock().is_empty();
        let timeout = if idle { Some(Duration::from_millis(100)) } else { Some(Duration::ZERO) };
        let dequeue_stamp = self.queue.dequeue_stamp();
        let _ = self.listener.poll_once(&self.status, dequeue_stamp, timeout, |sink, readable, writable| {
            if readable {
                match sink.take_input_waiter() {
                    Waiter::Fiber(id) => self.strand.run(id),
                    Waiter::Task(task) => self.tasks.lock().append(task),
                    Waiter::None => {}
                }
            }
            if writable {
                match sink.take_output_waiter() {
                    Waiter::Fiber(id) => self.strand.run(id),
                    Waiter::Task(task) => self.tasks.lock().append(task),
                    Waiter::None => {}
                }
            }
        });
    }

    /// Runs `run_tick` until [`Context::request_shutdown`] is called (typically by
    /// `bootstrap::Runtime::shutdown` from another thread, which then wakes this context's
    /// listener so the next tick's poll doesn't block for the full idle timeout).
    pub fn run_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_tick();
        }
    }
}

fn pack_args(args: &[usize]) -> [usize; MAX_ARGS] {
    let mut full = [0usize; MAX_ARGS];
    full[..args.len()].copy_from_slice(args);
    full
}

fn do_cancel_fiber(ctx: &Context, args: &[usize; MAX_ARGS]) {
    let id = FiberId::from_raw(args[0] as u32, args[1] as u32);
    ctx.strand.cancel(id);
}

/// Handler for a `balance_tasks` request: moves up to `tasks::MAX_SEND`-ish tasks to the
/// requester, then always sends a trailing [`clear_request_in_progress`] call. The MPMC ring's
/// per-producer FIFO order (already covered by `libs/mpmc`'s tests) guarantees that trailer
/// lands after every reassigned-task call sent in the same `reassign_to_peer` pass.
fn request_tasks(ctx: &Context, args: &[usize; MAX_ARGS]) {
    // Safety: `requester` is a peer context kept alive by the dispatcher's peer-group `Arc`s for
    // the lifetime of the runtime; the raw pointer was encoded from `&Context` by `balance_tasks`
    // on that same live context.
    let requester = unsafe { &*(args[0] as *const Context) };
    let mut tasks = ctx.tasks.lock();
    tasks.reassign_to_peer(requester, |call| ctx.call(requester, call.func, call.args));
    drop(tasks);
    ctx.call(requester, clear_request_in_progress, [0; MAX_ARGS]);
}

fn clear_request_in_progress(ctx: &Context, _args: &[usize; MAX_ARGS]) {
    ctx.tasks.lock().set_request_in_progress(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Task, TaskOps};

    fn make_context(id: usize) -> Arc<Context> {
        let listener = Listener::new().unwrap();
        let global_epoch = Arc::new(GlobalEpoch::new());
        Arc::new(Context::new(id, 16, 64 * 1024, listener, global_epoch))
    }

    #[test]
    fn alloc_and_free_round_trip_through_context() {
        let ctx = make_context(0);
        let ptr = ctx.alloc(64).unwrap();
        ctx.free(ptr).unwrap();
    }

    #[test]
    fn call_wakes_a_parked_peer() {
        let ctx = make_context(0);
        ctx.set_peers(vec![ctx.clone()]);
        ctx.status().try_enter_poll(ctx.queue().dequeue_stamp());
        static HIT: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        fn mark(_ctx: &Context, _args: &[usize; MAX_ARGS]) {
            HIT.store(true, Ordering::SeqCst);
        }
        ctx.call(&ctx, mark, [0; MAX_ARGS]);
        assert_eq!(ctx.status().load(Ordering::Acquire).0, crate::status::Kind::Pending);
        ctx.queue().drain(&ctx);
        assert!(HIT.load(Ordering::SeqCst));
    }

    #[test]
    fn register_and_close_sink_retires_it_for_reclamation() {
        let ctx = make_context(0);
        let mut fds = [0i32; 2];
        // Safety: `fds` has room for two fds, the standard `pipe(2)` contract.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let destroyed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let d2 = destroyed.clone();
        let sink = ctx
            .register_sink(read_fd, crate::sink::SinkFlags::REGULAR_INPUT, move || {
                d2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(sink.listener(), Some(ctx.id()));

        ctx.close_sink(&sink);
        assert!(sink.is_closed());
        assert!(!destroyed.load(Ordering::SeqCst), "destroy runs only after epoch reclamation");

        // Safety: both ends are still open and owned by this test.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn ping_pong_async_calls_drive_counter_to_a_thousand_in_order() {
        static COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        static NEXT_ACK: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

        fn incr(ctx: &Context, args: &[usize; MAX_ARGS]) {
            let n = args[0];
            COUNTER.fetch_add(1, Ordering::SeqCst);
            ctx.call(ctx.peers()[0].as_ref(), ack, [n, 0, 0, 0, 0, 0]);
        }

        fn ack(ctx: &Context, args: &[usize; MAX_ARGS]) {
            let n = args[0];
            assert_eq!(NEXT_ACK.fetch_add(1, Ordering::SeqCst), n);
            if n + 1 < 1000 {
                ctx.call(ctx.peers()[0].as_ref(), incr, [n + 1, 0, 0, 0, 0, 0]);
            }
        }

        let a = make_context(0);
        let b = make_context(1);
        // Each context's single "peer" is the other side, so `ctx.peers()[0]` inside a handler
        // always means "whoever called me".
        a.set_peers(vec![b.clone()]);
        b.set_peers(vec![a.clone()]);

        a.call(&b, incr, [0, 0, 0, 0, 0, 0]);

        while NEXT_ACK.load(Ordering::SeqCst) < 1000 {
            b.queue().drain(&b);
            a.queue().drain(&a);
        }

        assert_eq!(COUNTER.load(Ordering::SeqCst), 1000);
        assert_eq!(NEXT_ACK.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn balance_tasks_pulls_work_from_an_overloaded_peer() {
        static OPS: TaskOps = TaskOps {
            execute: |arg| arg,
            complete: |_arg, _value| {},
            reassign: |_arg, _target| true,
        };

        let a = make_context(0);
        let b = make_context(1);
        a.set_peers(vec![a.clone(), b.clone()]);
        b.set_peers(vec![a.clone(), b.clone()]);

        for i in 0..(DISTRIBUTE_THRESHOLD + 5) {
            b.tasks().lock().append(Task { ops: &OPS, arg: i });
        }

        a.balance_tasks();
        assert!(a.tasks().lock().request_in_progress());

        b.queue().drain(&b);
        a.queue().drain(&a);

        assert!(a.tasks().lock().len() > 0);
        assert!(!a.tasks().lock().request_in_progress());
    }
}
