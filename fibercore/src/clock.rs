//! Coarse monotonic + realtime timestamps (§3), refreshed once per scheduler tick rather than
//! read from the kernel on every use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct Clock {
    monotonic_ns: AtomicU64,
    realtime_ns: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        let c = Self::default();
        c.tick();
        c
    }

    /// Refreshes both timestamps from the OS. Called once per scheduler loop iteration by the
    /// owning thread; other threads only ever read via `monotonic_ns`/`realtime_ns`.
    pub fn tick(&self) {
        let mono = monotonic_now_ns();
        let real = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        self.monotonic_ns.store(mono, Ordering::Relaxed);
        self.realtime_ns.store(real, Ordering::Relaxed);
    }

    pub fn monotonic_ns(&self) -> u64 {
        self.monotonic_ns.load(Ordering::Relaxed)
    }

    pub fn realtime_ns(&self) -> u64 {
        self.realtime_ns.load(Ordering::Relaxed)
    }
}

fn monotonic_now_ns() -> u64 {
    // Safety: `clock_gettime` with `CLOCK_MONOTONIC` and a valid out-pointer is always sound.
    unsafe {
        let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        let ts = ts.assume_init();
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_monotonic() {
        let clock = Clock::new();
        let first = clock.monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(5));
        clock.tick();
        assert!(clock.monotonic_ns() > first);
    }
}
