//! Async call transport (component C, §4.3): each context owns one bounded MPMC ring of
//! fixed-width call records. A `call` targets a specific context; a `post` picks any eligible
//! peer and falls back to running the function inline.

use crate::context::Context;

/// Number of argument words carried alongside the function pointer, matching the source's
/// 7-word slot (function + up to 6 `uintptr_t` arguments).
pub const MAX_ARGS: usize = 6;

/// An async call's function receives the target context and its argument array. Arguments are
/// untyped words; callers agree on their meaning out of band, the same contract `add_1`/
/// `add_2`/`add_3` packs rely on for task reassignment (component D).
pub type AsyncFn = fn(&Context, &[usize; MAX_ARGS]);

pub struct AsyncCall {
    pub func: AsyncFn,
    pub args: [usize; MAX_ARGS],
}

impl AsyncCall {
    pub fn new(func: AsyncFn, args: [usize; MAX_ARGS]) -> Self {
        Self { func, args }
    }

    pub fn with_args(func: AsyncFn, args: &[usize]) -> Self {
        let mut full = [0usize; MAX_ARGS];
        full[..args.len()].copy_from_slice(args);
        Self::new(func, full)
    }
}

/// Escalating thresholds (§4.3) for a retry loop that keeps hitting a full queue: warn, then
/// error, then treat the situation as fatal (a stuck peer that never drains).
pub const WARN_RETRIES: u32 = 64;
pub const ERROR_RETRIES: u32 = 512;
pub const FATAL_RETRIES: u32 = 4096;

pub struct AsyncQueue {
    ring: mpmc_ring::Ring<AsyncCall>,
}

impl AsyncQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: mpmc_ring::Ring::new(capacity),
        }
    }

    /// Enqueues `call`, returning the producer stamp used to decide whether a parked listener
    /// observed it (§4.6). Returns the call back on failure so the caller can retry or defer.
    pub fn try_enqueue(&self, call: AsyncCall) -> Result<usize, AsyncCall> {
        self.ring.try_enqueue(call).map_err(|full| full.0)
    }

    /// Drains every currently queued call, invoking each against `ctx`. Called once per
    /// `Context::run_tick`, before the strand runs any fiber for that tick — never from inside a
    /// fiber resume — so a handler is free to touch `ctx`'s strand (e.g. `Strand::run`) without
    /// racing a fiber stack switch already in progress on this thread.
    pub fn drain(&self, ctx: &Context) -> usize {
        self.ring.drain(|call| (call.func)(ctx, &call.args))
    }

    /// Snapshot of the dequeue counter, embedded into the status word when parking (§4.6).
    pub fn dequeue_stamp(&self) -> usize {
        self.ring.dequeue_stamp()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Retries `try_enqueue` with escalating backoff, logging at the thresholds described in §4.3.
/// Used by the remote-free retry path and any other caller that has already decided blocking is
/// acceptable (callers that want to defer instead should use `try_enqueue` directly).
pub fn enqueue_with_backoff(queue: &AsyncQueue, mut call: AsyncCall, what: &str) -> usize {
    let mut attempts: u32 = 0;
    loop {
        match queue.try_enqueue(call) {
            Ok(stamp) => return stamp,
            Err(back) => {
                call = back;
                attempts += 1;
                if attempts == WARN_RETRIES {
                    tracing::warn!(what, attempts, "async queue full, still retrying");
                } else if attempts == ERROR_RETRIES {
                    tracing::error!(what, attempts, "async queue still full after many retries");
                } else if attempts >= FATAL_RETRIES {
                    crate::error::abort_on_fatal("async queue never drained");
                }
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &Context, _args: &[usize; MAX_ARGS]) {}

    #[test]
    fn try_enqueue_reports_capacity_and_stamp() {
        let q = AsyncQueue::new(16);
        assert_eq!(q.capacity(), 16);
        let stamp = q.try_enqueue(AsyncCall::new(noop, [0; MAX_ARGS])).unwrap();
        assert_eq!(stamp, 0);
    }
}
