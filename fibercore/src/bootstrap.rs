//! Runtime bootstrap (component I, spec.md §6 "Environment"/"Runtime start/stop"): builds a
//! `RuntimeConfig`, constructs one [`Context`] per worker thread, wires them into a peer group,
//! and spawns the threads that run each context's scheduler loop until shutdown.

use std::sync::Arc;
use std::thread;

use crate::context::Context;
use crate::epoch::GlobalEpoch;
use crate::error::{Error, Result};
use crate::listener::Listener;

/// Floor enforced on `queue_capacity`, matching `mpmc_ring::Ring`'s own minimum (§4.1).
const MIN_QUEUE_CAPACITY: usize = 16;
/// Sanity floor on `stack_size` — smaller than this and a fiber's own prologue risks overrunning
/// its guard page before user code runs at all.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Builder for the parameters spec.md §6 groups under "Environment": thread count, per-context
/// async-queue capacity, fiber stack size, optional CPU affinity, and dispatcher grouping.
/// Validated at [`RuntimeConfigBuilder::build`] rather than panicking on bad input, the same
/// fail-fast-but-typed posture `cache`'s allocation requests already use.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    thread_count: usize,
    queue_capacity: usize,
    stack_size: usize,
    affinity: Option<Vec<usize>>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
    thread_count: usize,
    queue_capacity: usize,
    stack_size: usize,
    affinity: Option<Vec<usize>>,
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self {
            thread_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            queue_capacity: 256,
            stack_size: crate::strand::DEFAULT_STACK_SIZE,
            affinity: None,
        }
    }
}

impl RuntimeConfigBuilder {
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn stack_size(mut self, n: usize) -> Self {
        self.stack_size = n;
        self
    }

    /// Pins each worker thread `i` (`0..thread_count`) to `mask[i % mask.len()]`'s CPU index.
    pub fn affinity(mut self, mask: Vec<usize>) -> Self {
        self.affinity = Some(mask);
        self
    }

    pub fn build(self) -> Result<RuntimeConfig> {
        if self.thread_count == 0 {
            return Err(Error::InvalidConfig("thread_count must be at least 1"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig("stack_size is too small to be safe"));
        }
        if let Some(mask) = &self.affinity {
            if mask.is_empty() {
                return Err(Error::InvalidConfig("affinity mask must not be empty if provided"));
            }
        }
        Ok(RuntimeConfig {
            thread_count: self.thread_count,
            queue_capacity: self.queue_capacity.max(MIN_QUEUE_CAPACITY),
            stack_size: self.stack_size,
            affinity: self.affinity,
        })
    }
}

/// A group of contexts sharing one global epoch and one reassignment peer set (spec.md §6
/// "dispatcher grouping"). Owns nothing the contexts don't already share by `Arc`; it exists so
/// [`Runtime`] has a single handle to hand back to a caller that wants to inspect live contexts
/// without reaching into thread-local state.
pub struct Dispatcher {
    global_epoch: Arc<GlobalEpoch>,
    contexts: Vec<Arc<Context>>,
}

impl Dispatcher {
    pub fn contexts(&self) -> &[Arc<Context>] {
        &self.contexts
    }

    pub fn global_epoch(&self) -> &Arc<GlobalEpoch> {
        &self.global_epoch
    }
}

/// A running fibercore runtime: one OS thread per context, each running that context's scheduler
/// loop until [`Runtime::shutdown`] is called.
pub struct Runtime {
    dispatcher: Arc<Dispatcher>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Builds every context up front (thread-identity allocation is therefore just this loop's
    /// index — spec.md §5's "single short-held lock" has nothing to contend over since no
    /// context can join after bootstrap), wires them into one peer group, then spawns one thread
    /// per context. `on_start`/`on_stop` run on each worker thread immediately before/after that
    /// context's scheduler loop (spec.md §6 "start/stop hook invocation").
    pub fn start<F, G>(config: &RuntimeConfig, on_start: F, on_stop: G) -> Result<Self>
    where
        F: Fn(&Context) + Send + Sync + 'static,
        G: Fn(&Context) + Send + Sync + 'static,
    {
        let global_epoch = Arc::new(GlobalEpoch::new());

        let mut contexts = Vec::with_capacity(config.thread_count);
        for id in 0..config.thread_count {
            let listener = Listener::new().map_err(Error::Io)?;
            contexts.push(Arc::new(Context::new(
                id,
                config.queue_capacity,
                config.stack_size,
                listener,
                global_epoch.clone(),
            )));
        }
        for ctx in &contexts {
            ctx.set_peers(contexts.clone());
        }

        let dispatcher = Arc::new(Dispatcher { global_epoch, contexts: contexts.clone() });
        let on_start = Arc::new(on_start);
        let on_stop = Arc::new(on_stop);

        let mut handles = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            let on_start = on_start.clone();
            let on_stop = on_stop.clone();
            let cpu = config
                .affinity
                .as_ref()
                .map(|mask| mask[ctx.id() % mask.len()]);
            let handle = thread::Builder::new()
                .name(format!("fibercore-{}", ctx.id()))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        set_affinity(cpu);
                    }
                    on_start(&ctx);
                    ctx.run_loop();
                    on_stop(&ctx);
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok(Self { dispatcher, handles })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Graceful shutdown (spec.md §7): asks every context to exit its loop after its current
    /// tick, wakes each one in case it's parked in `poll_once`, joins every thread, then flushes
    /// whatever work/memory was left pending.
    pub fn shutdown(self) {
        for ctx in self.dispatcher.contexts() {
            ctx.request_shutdown();
            ctx.listener().notify();
        }
        for handle in self.handles {
            let _ = handle.join();
        }
        for ctx in self.dispatcher.contexts() {
            ctx.tasks().lock().execute_all();
            ctx.cache().lock().cache_collect();
        }
        tracing::info!(threads = self.dispatcher.contexts().len(), "fibercore runtime stopped");
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(cpu: usize) {
    // Safety: a default-initialized `cpu_set_t` is a valid all-zero bitmask; `CPU_SET` and
    // `sched_setaffinity` are sound for any in-range `cpu` index on the current thread (pid 0).
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(cpu, "failed to pin worker thread to requested cpu");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_cpu: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builder_rejects_zero_threads() {
        let err = RuntimeConfig::builder().thread_count(0).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn builder_floors_queue_capacity() {
        let cfg = RuntimeConfig::builder().queue_capacity(1).build().unwrap();
        assert_eq!(cfg.queue_capacity, MIN_QUEUE_CAPACITY);
    }

    #[test]
    fn runtime_starts_runs_and_shuts_down() {
        static STARTED: AtomicUsize = AtomicUsize::new(0);
        static STOPPED: AtomicUsize = AtomicUsize::new(0);

        let config = RuntimeConfig::builder()
            .thread_count(2)
            .stack_size(MIN_STACK_SIZE)
            .build()
            .unwrap();

        let runtime = Runtime::start(
            &config,
            |_ctx| {
                STARTED.fetch_add(1, Ordering::SeqCst);
            },
            |_ctx| {
                STOPPED.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        runtime.shutdown();

        assert_eq!(STARTED.load(Ordering::SeqCst), 2);
        assert_eq!(STOPPED.load(Ordering::SeqCst), 2);
    }
}
