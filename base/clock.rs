// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clock interface and implementations for testability.

use std::mem;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time from `CLOCK_REALTIME`, in
    /// milliseconds since the Unix epoch.
    fn realtime_ms(&self) -> i64;

    /// Gets the current time from a monotonic clock, as a duration since an
    /// arbitrary per-boot epoch.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Duration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> libc::timespec {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            ts.assume_init()
        }
    }
}

impl Clocks for RealClocks {
    fn realtime_ms(&self) -> i64 {
        let ts = self.get(libc::CLOCK_REALTIME);
        // On 32-bit arm builds `tv_sec` is an `i32`; elsewhere the `into()`
        // is a no-op.
        #[allow(clippy::useless_conversion)]
        let sec: i64 = ts.tv_sec.into();
        sec * 1_000 + (ts.tv_nsec as i64) / 1_000_000
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Duration {
        let ts = self.get(libc::CLOCK_BOOTTIME);
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Duration {
        let ts = self.get(libc::CLOCK_MONOTONIC);
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    fn sleep(&self, how_long: Duration) {
        thread::sleep(how_long)
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot_ms: i64,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    /// Creates a simulated clock booted at the given wall-clock time
    /// (milliseconds since the Unix epoch).
    pub fn new(boot_ms: i64) -> Self {
        SimulatedClocks(std::sync::Arc::new(SimulatedClocksInner {
            boot_ms,
            uptime: Mutex::new(Duration::from_secs(0)),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime_ms(&self) -> i64 {
        self.0.boot_ms + self.0.uptime.lock().unwrap().as_millis() as i64
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock().unwrap()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data is not immediately
    /// available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(Duration::new(0, 0));
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let c = SimulatedClocks::new(1_700_000_000_000);
        assert_eq!(c.realtime_ms(), 1_700_000_000_000);
        c.sleep(Duration::from_millis(2_500));
        assert_eq!(c.realtime_ms(), 1_700_000_002_500);
        assert_eq!(c.monotonic(), Duration::from_millis(2_500));
    }

    #[test]
    fn real_monotonic_is_nondecreasing() {
        let c = RealClocks {};
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
