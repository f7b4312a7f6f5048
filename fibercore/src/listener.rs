//! Event listener & dispatch (component F, §4.6): the per-context bridge to a kernel event
//! backend. A listener's *state* is not a separate word — it is the same
//! [`crate::status::StatusWord`] the owning context already carries; this module only adds the
//! poll/notify machinery and the epoch bookkeeping (§4.7) layered on top of it.
//!
//! The backend is abstracted behind [`Backend`] (§4.6: "abstracted: kqueue, epoll, or
//! equivalent"); [`EpollBackend`] is the one concrete implementation this crate ships, since
//! Linux `epoll` is the only backend this workspace can exercise. A `kqueue`/IOCP backend would
//! implement the same trait and slot in unchanged.

use crate::epoch::LocalEpoch;
use crate::sink::{Sink, SinkFlags};
use crate::status::StatusWord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One readiness report for a registered fd.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// The kernel-event backend contract (§4.6). Implementations own exactly one notify channel
/// (eventfd/pipe/self-pipe) registered for readability alongside whatever fds the caller adds.
pub trait Backend: Send + Sync {
    fn register(&self, fd: RawFd, read: bool, write: bool) -> std::io::Result<()>;
    fn modify(&self, fd: RawFd, read: bool, write: bool) -> std::io::Result<()>;
    fn deregister(&self, fd: RawFd) -> std::io::Result<()>;
    /// Blocks up to `timeout` (`None` = forever) for at least one readiness event, appending
    /// reports to `out`. Returns the number appended.
    fn poll(&self, out: &mut Vec<Event>, timeout: Option<Duration>) -> std::io::Result<usize>;
    fn notify_fd(&self) -> RawFd;
    /// Writes one byte to the notify channel, waking a parked `poll` (§4.6 "Notification").
    fn notify(&self);
    /// Drains the notify channel after a wake so the next park doesn't spuriously fire.
    fn drain_notify(&self);
}

/// Linux `epoll`-backed [`Backend`]. Each listener owns its own epoll instance and notify
/// `eventfd` so a write to its notify channel wakes exactly that listener's thread and no
/// other — sharing one epoll set across threads can't target a specific waiter.
pub struct EpollBackend {
    epfd: RawFd,
    notify_fd: RawFd,
}

impl EpollBackend {
    pub fn new() -> std::io::Result<Self> {
        // Safety: plain integer arguments; failure is reported via errno and checked below.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // Safety: `eventfd` with `EFD_NONBLOCK | EFD_CLOEXEC` and no extra arguments is sound.
        let notify_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if notify_fd < 0 {
            let err = std::io::Error::last_os_error();
            // Safety: `epfd` was just successfully created.
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }
        let backend = Self { epfd, notify_fd };
        backend.register(notify_fd, true, false)?;
        Ok(backend)
    }

    fn ctl(&self, op: i32, fd: RawFd, read: bool, write: bool) -> std::io::Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: `self.epfd` is a live epoll instance owned by this struct; `ev` is a valid,
        // fully-initialized `epoll_event` whenever `op` needs one (ignored for `EPOLL_CTL_DEL`).
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register(&self, fd: RawFd, read: bool, write: bool) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, read, write)
    }

    fn modify(&self, fd: RawFd, read: bool, write: bool) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, read, write)
    }

    fn deregister(&self, fd: RawFd) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, false, false)
    }

    fn poll(&self, out: &mut Vec<Event>, timeout: Option<Duration>) -> std::io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; 64];
        // Safety: `raw` is a valid buffer of the given length; `self.epfd` is live.
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        let before = out.len();
        for ev in &raw[..n as usize] {
            out.push(Event {
                fd: ev.u64 as RawFd,
                readable: ev.events & (libc::EPOLLIN as u32) != 0,
                writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                error: ev.events & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0,
            });
        }
        Ok(out.len() - before)
    }

    fn notify_fd(&self) -> RawFd {
        self.notify_fd
    }

    fn notify(&self) {
        let one: u64 = 1;
        // Safety: `notify_fd` is a live eventfd; writing 8 bytes matches its ABI. `EAGAIN` (the
        // counter is already saturated) is an acceptable outcome — the wake is still pending.
        unsafe {
            libc::write(self.notify_fd, (&one as *const u64).cast(), 8);
        }
    }

    fn drain_notify(&self) {
        let mut buf: u64 = 0;
        // Safety: `notify_fd` is a live, non-blocking eventfd.
        loop {
            let rc = unsafe { libc::read(self.notify_fd, (&mut buf as *mut u64).cast(), 8) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // Safety: both fds are owned exclusively by this struct.
        unsafe {
            libc::close(self.notify_fd);
            libc::close(self.epfd);
        }
    }
}

/// Per-context listener (§4.6): owns a backend, the sinks currently registered to it, and the
/// epoch-reclamation bookkeeping for sinks it closes.
pub struct Listener {
    backend: Box<dyn Backend>,
    sinks: Mutex<HashMap<RawFd, Arc<Sink>>>,
    epoch: LocalEpoch,
    observe_nudges: AtomicU64,
}

impl Listener {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            backend: Box::new(EpollBackend::new()?),
            sinks: Mutex::new(HashMap::new()),
            epoch: LocalEpoch::new(),
            observe_nudges: AtomicU64::new(0),
        })
    }

    pub fn local_epoch(&self) -> &LocalEpoch {
        &self.epoch
    }

    pub fn notify_fd(&self) -> RawFd {
        self.backend.notify_fd()
    }

    pub fn notify(&self) {
        self.backend.notify();
    }

    /// Registers `sink` (already assigned to this listener, per [`Sink::try_claim_listener`])
    /// with the backend.
    pub fn bind(&self, sink: Arc<Sink>) -> std::io::Result<()> {
        let flags = sink.flags();
        let read = flags.intersects(SinkFlags::REGULAR_INPUT | SinkFlags::ONESHOT_INPUT)
            || flags.contains(SinkFlags::FIXED_POLLER);
        let write = flags.intersects(SinkFlags::REGULAR_OUTPUT | SinkFlags::ONESHOT_OUTPUT);
        self.backend.register(sink.fd, read, write)?;
        self.sinks.lock().insert(sink.fd, sink);
        Ok(())
    }

    /// Rearms a side after it has fired once (§4.6: "a oneshot-input sink rearms after each
    /// event"). Called from [`Listener::poll_once`]'s delivery loop with interest bits computed
    /// by [`oneshot_interest`] — a `REGULAR_*` side is always passed back armed, a `ONESHOT_*`
    /// side only if this batch didn't just fire it.
    pub fn rearm(&self, fd: RawFd, read: bool, write: bool) -> std::io::Result<()> {
        self.backend.modify(fd, read, write)
    }

    /// Deregisters and drops this listener's handle to `fd`'s sink, returning it so the caller
    /// can retire it into epoch reclamation.
    pub fn unbind(&self, fd: RawFd) -> Option<Arc<Sink>> {
        let _ = self.backend.deregister(fd);
        self.sinks.lock().remove(&fd)
    }

    pub fn sink(&self, fd: RawFd) -> Option<Arc<Sink>> {
        self.sinks.lock().get(&fd).cloned()
    }

    /// Best-effort hint from epoch reclamation (§4.7: "optionally post that listener a 'please
    /// observe' call"): recorded for observability and tracing only. Actually forcing the
    /// listener to observe would need a handle back to its owning context, and this module
    /// deliberately doesn't hold one (a listener-to-context back-reference would create the
    /// exact reference cycle §9 steers away from) — the listener will pick up the new epoch on
    /// its own next `poll_once`/`enter` regardless, so the nudge is an optimization, not a
    /// correctness requirement.
    pub fn request_observe(&self) {
        self.observe_nudges.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("epoch reclamation requested this listener observe the current epoch");
    }

    pub fn observe_nudge_count(&self) -> u64 {
        self.observe_nudges.load(Ordering::Relaxed)
    }

    /// One dispatch pass (§4.6): park in `POLLING` (unless a post already raced us to
    /// `PENDING`), block in the backend, then route each readiness report to `on_ready`.
    /// `on_ready` decides — per the sink's I/O vtable — whether to resume a blocked fiber or
    /// append a task, since this module doesn't know about `Strand`/`TaskList` internals.
    pub fn poll_once(
        &self,
        status: &StatusWord,
        dequeue_stamp: usize,
        timeout: Option<Duration>,
        mut on_ready: impl FnMut(&Arc<Sink>, bool, bool),
    ) -> std::io::Result<usize> {
        if !status.try_enter_poll(dequeue_stamp) {
            return Ok(0);
        }

        let mut events = Vec::with_capacity(64);
        let result = self.backend.poll(&mut events, timeout);
        status.begin_running();
        self.backend.drain_notify();
        let n = result?;

        let notify_fd = self.backend.notify_fd();
        let mut delivered = 0;
        for ev in &events {
            if ev.fd == notify_fd {
                continue;
            }
            let Some(sink) = self.sink(ev.fd) else {
                continue;
            };
            if ev.error {
                sink.set_error();
            }
            if ev.readable {
                sink.set_ready_input();
                on_ready(&sink, true, false);
                delivered += 1;
            }
            if ev.writable {
                sink.set_ready_output();
                on_ready(&sink, false, true);
                delivered += 1;
            }

            let flags = sink.flags();
            if flags.intersects(SinkFlags::ONESHOT_INPUT | SinkFlags::ONESHOT_OUTPUT) {
                let (read, write) = oneshot_interest(flags, ev.readable, ev.writable);
                if let Err(err) = self.rearm(sink.fd, read, write) {
                    tracing::warn!(fd = sink.fd, %err, "failed to rearm sink after event");
                }
            }
        }
        let _ = n;
        Ok(delivered)
    }
}

/// Interest bits to rearm a sink with after a batch of events (§4.6). A `REGULAR_*` side is
/// always reported armed; a `ONESHOT_*` side is reported armed only if this batch didn't just
/// fire it, so each side reports at most once per arm before needing an explicit rearm.
fn oneshot_interest(flags: SinkFlags, input_fired: bool, output_fired: bool) -> (bool, bool) {
    let read = flags.contains(SinkFlags::FIXED_POLLER)
        || flags.contains(SinkFlags::REGULAR_INPUT)
        || (flags.contains(SinkFlags::ONESHOT_INPUT) && !input_fired);
    let write = flags.contains(SinkFlags::REGULAR_OUTPUT)
        || (flags.contains(SinkFlags::ONESHOT_OUTPUT) && !output_fired);
    (read, write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkFlags;
    use crate::status::{Kind, StatusWord};
    use std::sync::atomic::Ordering as StdOrdering;

    #[test]
    fn notify_wakes_a_parked_poll() {
        let listener = Listener::new().unwrap();
        let status = StatusWord::new();
        listener.notify();

        let mut delivered = None;
        let n = listener
            .poll_once(&status, 0, Some(Duration::from_secs(5)), |_, _, _| {
                delivered = Some(());
            })
            .unwrap();
        assert_eq!(n, 0);
        assert!(delivered.is_none());
        assert_eq!(status.load(StdOrdering::Acquire).0, Kind::Running);
    }

    #[test]
    fn pipe_readability_is_delivered_to_the_owning_sink() {
        let listener = Listener::new().unwrap();
        let mut fds = [0i32; 2];
        // Safety: `fds` has room for two fds, the standard `pipe(2)` contract.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let sink = Arc::new(Sink::new(read_fd, SinkFlags::REGULAR_INPUT, || {}));
        sink.try_claim_listener(0);
        listener.bind(sink.clone()).unwrap();

        // Safety: `write_fd` is the writable end of the pipe created above.
        unsafe {
            libc::write(write_fd, b"x".as_ptr().cast(), 1);
        }

        let status = StatusWord::new();
        let mut saw_readable = false;
        listener
            .poll_once(&status, 0, Some(Duration::from_secs(5)), |s, readable, _| {
                if s.fd == read_fd && readable {
                    saw_readable = true;
                }
            })
            .unwrap();
        assert!(saw_readable);

        // Safety: both ends are still open and owned by this test.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn oneshot_input_fires_once_then_needs_an_explicit_rearm() {
        let listener = Listener::new().unwrap();
        let mut fds = [0i32; 2];
        // Safety: `fds` has room for two fds, the standard `pipe(2)` contract.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let sink = Arc::new(Sink::new(read_fd, SinkFlags::ONESHOT_INPUT, || {}));
        sink.try_claim_listener(0);
        listener.bind(sink.clone()).unwrap();

        // Safety: `write_fd` is the writable end of the pipe created above, written once per poll.
        unsafe {
            libc::write(write_fd, b"x".as_ptr().cast(), 1);
        }

        let status = StatusWord::new();
        let mut deliveries = 0;
        listener
            .poll_once(&status, 0, Some(Duration::from_secs(5)), |_, readable, _| {
                if readable {
                    deliveries += 1;
                }
            })
            .unwrap();
        assert_eq!(deliveries, 1, "first event delivered");

        // Still unread data in the pipe, but the sink was disarmed after firing once: a poll
        // with a short timeout must not redeliver it.
        let n = listener
            .poll_once(&status, 0, Some(Duration::from_millis(50)), |_, readable, _| {
                if readable {
                    deliveries += 1;
                }
            })
            .unwrap();
        assert_eq!(n, 0, "a one-shot side must not fire again before being rearmed");
        assert_eq!(deliveries, 1);

        listener.rearm(read_fd, true, false).unwrap();
        listener
            .poll_once(&status, 0, Some(Duration::from_secs(5)), |_, readable, _| {
                if readable {
                    deliveries += 1;
                }
            })
            .unwrap();
        assert_eq!(deliveries, 2, "rearmed side fires again for the still-unread data");

        // Safety: both ends are still open and owned by this test.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
