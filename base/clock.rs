// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use std::mem;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::shutdown::ShutdownError;
use crate::{Error, Mutex};

/// A point on the monotonic clock, as a duration since boot.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(Duration);

impl Instant {
    pub fn from_secs(secs: u64) -> Self {
        Instant(Duration::from_secs(secs))
    }

    /// Returns `self - earlier`, or zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current time from `CLOCK_REALTIME`.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Retries `f` forever (sleeping 1 s between attempts) until success or
/// shutdown.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        let sleep_time = Duration::from_secs(1);
        warn!(err = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(sleep_time);
    }
}

/// Waits for a worker thread to exit, polling its `exited` flag every 100 ms
/// for up to 5 s, then joins. Past the deadline the handle is dropped
/// (detaching the thread) and a warning is logged.
///
/// This always uses the real clock: the poll/deadline contract is about wall
/// time even in tests driven by [`SimulatedClocks`].
pub fn join_or_detach(handle: thread::JoinHandle<()>, exited: &Arc<AtomicBool>, what: &str) {
    const POLL: Duration = Duration::from_millis(100);
    const DEADLINE: Duration = Duration::from_secs(5);
    let start = std::time::Instant::now();
    while !exited.load(Ordering::SeqCst) {
        if start.elapsed() >= DEADLINE {
            warn!("{what}: thread did not exit within {DEADLINE:?}; detaching");
            drop(handle);
            return;
        }
        thread::sleep(POLL);
    }
    if let Err(e) = handle.join() {
        warn!("{what}: thread panicked: {e:?}");
    }
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
    fn realtime(&self) -> jiff::Timestamp {
        let ts = self.get(libc::CLOCK_REALTIME);
        // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
        #[allow(clippy::useless_conversion)]
        jiff::Timestamp::new(i64::from(ts.tv_sec), ts.tv_nsec as i32)
            .expect("CLOCK_REALTIME within Timestamp range")
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        let ts = self.get(libc::CLOCK_BOOTTIME);
        Instant(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        let ts = self.get(libc::CLOCK_MONOTONIC);
        Instant(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
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

/// Logs a warning if the TimerGuard lives "too long", using the label created
/// by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
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
        let elapsed = self.clocks.monotonic().saturating_since(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().expect("label_f is set until drop");
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::from_secs(0)),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = *self.0.uptime.lock();
        self.0
            .boot
            .checked_add(jiff::SignedDuration::try_from(uptime).expect("uptime fits"))
            .expect("simulated time within Timestamp range")
    }

    fn monotonic(&self) -> Instant {
        Instant(*self.0.uptime.lock())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
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
    fn simulated_advance() {
        let boot: jiff::Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        let c = SimulatedClocks::new(boot);
        assert_eq!(c.realtime(), boot);
        c.sleep(Duration::from_secs(90));
        assert_eq!(c.realtime(), boot.checked_add(jiff::SignedDuration::from_secs(90)).unwrap());
        assert_eq!(c.monotonic(), Instant::from_secs(90));
    }

    #[test]
    fn simulated_recv_timeout_advances_on_empty() {
        let c = SimulatedClocks::new("2026-01-01T00:00:00Z".parse().unwrap());
        let (tx, rx) = mpsc::channel::<u32>();
        tx.send(7).unwrap();
        assert_eq!(c.recv_timeout(&rx, Duration::from_secs(60)), Ok(7));
        assert_eq!(c.monotonic(), Instant::default());
        assert!(c.recv_timeout(&rx, Duration::from_secs(60)).is_err());
        assert_eq!(c.monotonic(), Instant::from_secs(60));
    }

    #[test]
    fn instant_saturates() {
        let a = Instant::from_secs(5);
        let b = Instant::from_secs(8);
        assert_eq!(b.saturating_since(a), Duration::from_secs(3));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }
}
