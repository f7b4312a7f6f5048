//! Task list (component D, §4.4): a chunked FIFO of one-shot `(ops, arg)` pairs owned by
//! exactly one context, with a reassignment path that moves an acceptable prefix to a peer.

use crate::context::Context;
use crate::queue::{AsyncCall, MAX_ARGS};
use std::collections::VecDeque;

/// Default chunk size: a tail chunk accepts this many tasks before a fresh chunk is appended.
const CHUNK_SIZE: usize = 16;

/// How many head tasks `reassign_to_peer` will examine before giving up — one async call can
/// carry at most `MAX_ARGS / 2` `(ops, arg)` pairs, so three peer-bound calls cover it.
const MAX_SEND: usize = 3 * (MAX_ARGS / 2);

/// Under this load, a context asks an overloaded peer for work.
pub const REQUEST_THRESHOLD: usize = 9;

/// A task's three operations: run it, deliver its result, and decide (during reassignment)
/// whether it may move to another context. Modeled as a `'static` function-pointer table rather
/// than a trait object so a task reference packs into a single word for the async-call wire
/// format, the same way the source's vtable pointer does.
pub struct TaskOps {
    pub execute: fn(arg: usize) -> usize,
    pub complete: fn(arg: usize, value: usize),
    pub reassign: fn(arg: usize, target: &Context) -> bool,
}

#[derive(Clone, Copy)]
pub struct Task {
    pub ops: &'static TaskOps,
    pub arg: usize,
}

struct Chunk {
    items: VecDeque<Task>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            items: VecDeque::with_capacity(CHUNK_SIZE),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= CHUNK_SIZE
    }
}

#[derive(Debug, Default)]
pub struct TaskStats {
    pub submitted: u64,
    pub executed: u64,
    pub reassigned: u64,
    pub requests_sent: u64,
}

pub struct TaskList {
    chunks: VecDeque<Chunk>,
    len: usize,
    stats: TaskStats,
    request_in_progress: bool,
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskList {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            stats: TaskStats::default(),
            request_in_progress: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Appends a task to the tail chunk, allocating a fresh chunk if the tail is full.
    pub fn append(&mut self, task: Task) {
        if self.chunks.back().is_none_or(Chunk::is_full) {
            self.chunks.push_back(Chunk::new());
        }
        self.chunks.back_mut().unwrap().items.push_back(task);
        self.len += 1;
        self.stats.submitted += 1;
    }

    /// Drains the whole list head-to-tail, executing each task and delivering its result.
    /// Releases a chunk once it empties.
    pub fn execute_all(&mut self) {
        while let Some(chunk) = self.chunks.front_mut() {
            let Some(task) = chunk.items.pop_front() else {
                self.chunks.pop_front();
                continue;
            };
            self.len -= 1;
            self.stats.executed += 1;
            let value = (task.ops.execute)(task.arg);
            (task.ops.complete)(task.arg, value);
        }
    }

    /// Walks up to `MAX_SEND` head tasks, asking each `reassign(arg, target)` whether it may
    /// move. Stops at the first refusal — a later reassignable task must never pass an earlier
    /// non-reassignable one. Accepted tasks are packed two-per-word-pair into async calls and
    /// handed to `target` via `post_fn`; returns the number of tasks actually transferred.
    pub fn reassign_to_peer(
        &mut self,
        target: &Context,
        mut send: impl FnMut(AsyncCall),
    ) -> usize {
        let mut accepted = Vec::with_capacity(MAX_SEND);
        while accepted.len() < MAX_SEND {
            let Some(chunk) = self.chunks.front() else {
                break;
            };
            let Some(task) = chunk.items.front().copied() else {
                self.chunks.pop_front();
                continue;
            };
            if !(task.ops.reassign)(task.arg, target) {
                break;
            }
            self.chunks.front_mut().unwrap().items.pop_front();
            self.len -= 1;
            if self.chunks.front().is_some_and(|c| c.items.is_empty()) {
                self.chunks.pop_front();
            }
            accepted.push(task);
        }

        let moved = accepted.len();
        for pair in accepted.chunks(MAX_ARGS / 2) {
            let mut args = [0usize; MAX_ARGS];
            for (i, task) in pair.iter().enumerate() {
                args[i * 2] = task.ops as *const TaskOps as usize;
                args[i * 2 + 1] = task.arg;
            }
            send(AsyncCall::new(deliver_reassigned_tasks, args));
        }
        self.stats.reassigned += moved as u64;
        moved
    }

    pub fn request_in_progress(&self) -> bool {
        self.request_in_progress
    }

    pub fn set_request_in_progress(&mut self, v: bool) {
        self.request_in_progress = v;
    }

    pub fn record_request_sent(&mut self) {
        self.stats.requests_sent += 1;
    }
}

/// Async-call target invoked on the receiving context to unpack up to three `(ops, arg)` pairs
/// reassigned by a peer and append them to the local task list.
fn deliver_reassigned_tasks(ctx: &Context, args: &[usize; MAX_ARGS]) {
    for pair in args.chunks(2) {
        let [ops_word, arg] = [pair[0], pair[1]];
        if ops_word == 0 {
            continue;
        }
        // Safety: `ops_word` was encoded from a live `&'static TaskOps` by `reassign_to_peer`
        // on the sending context; task ops tables are always `'static`.
        let ops = unsafe { &*(ops_word as *const TaskOps) };
        ctx.tasks().lock().append(Task { ops, arg });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNT_OPS: TaskOps = TaskOps {
        execute: |arg| arg + 1,
        complete: |_arg, _value| {},
        reassign: |_arg, _target| true,
    };

    static PINNED_OPS: TaskOps = TaskOps {
        execute: |arg| arg,
        complete: |_arg, _value| {},
        reassign: |_arg, _target| false,
    };

    #[test]
    fn append_and_execute_all_drains_in_order() {
        let mut list = TaskList::new();
        for i in 0..40 {
            list.append(Task { ops: &COUNT_OPS, arg: i });
        }
        assert_eq!(list.len(), 40);
        list.execute_all();
        assert!(list.is_empty());
        assert_eq!(list.stats().executed, 40);
    }

    #[test]
    fn reassign_stops_at_first_refusal() {
        let mut list = TaskList::new();
        list.append(Task { ops: &COUNT_OPS, arg: 1 });
        list.append(Task { ops: &COUNT_OPS, arg: 2 });
        list.append(Task { ops: &PINNED_OPS, arg: 3 });
        list.append(Task { ops: &COUNT_OPS, arg: 4 });

        let mut sent = Vec::new();
        // `target` is never dereferenced by the stub ops above, so a dangling-but-unused
        // reference is fine here; real callers always pass a live context.
        let moved = list.reassign_to_peer(unsafe { &*std::ptr::dangling::<Context>() }, |call| {
            sent.push(call)
        });
        assert_eq!(moved, 2);
        assert_eq!(list.len(), 2);
        assert_eq!(sent.len(), 1);
    }
}
