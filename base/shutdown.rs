// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, checked, and blocked on from worker threads.
//! Dropping the single [`Sender`] requests shutdown.

use std::sync::Arc;
use std::time::Duration;

use crate::{Condvar, Mutex};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `true` iff shutdown has already happened.
    requested: Mutex<bool>,

    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify waiters.
        // The opposite order would create a race in which something might
        // never wake.
        *self.0.requested.lock() = true;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.requested.lock() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks for up to `timeout`, returning early with an error on shutdown.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.requested.lock();
        let result = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |requested| !*requested);
        if result.1.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        requested: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = super::channel();
        rx.wait_for(std::time::Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || {
            rx.wait_for(std::time::Duration::from_secs(1000))
                .unwrap_err()
        });

        // Make it likely that rx has done its initial check and is waiting on
        // the Condvar.
        std::thread::sleep(std::time::Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }

    #[test]
    fn already_down_wait_returns_immediately() {
        let (tx, rx) = super::channel();
        drop(tx);
        rx.wait_for(std::time::Duration::from_secs(1000))
            .unwrap_err();
    }
}
