// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown. Receivers can be cloned,
//! checked cheaply from hot loops, and blocked on with a timeout from tick
//! loops. The [`signals`] submodule bridges SIGINT/SIGTERM to a
//! process-global flag for the top-level command loops.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// True iff shutdown has been requested.
    done: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify waiters. The
        // opposite order would create a race in which something might never
        // wake.
        *self.0.done.lock().unwrap() = true;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.done.lock().unwrap() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Sleeps until the timeout expires (`Ok`) or shutdown is requested
    /// (`Err`), whichever comes first.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.done.lock().unwrap();
        let result = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |done| !*done)
            .unwrap();
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
        done: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

/// SIGINT/SIGTERM handling for the top-level command loops.
///
/// Signal handlers can't safely touch a condvar, so the handler only sets an
/// atomic flag; the loops poll [`requested`] on each tick.
pub mod signals {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicBool, Ordering};

    static REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handle(_sig: libc::c_int) {
        REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Installs handlers for SIGINT and SIGTERM.
    pub fn install() {
        let sa = SigAction::new(
            SigHandler::Handler(handle),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = signal::sigaction(Signal::SIGINT, &sa);
            let _ = signal::sigaction(Signal::SIGTERM, &sa);
        }
    }

    /// True iff a termination signal has been received.
    pub fn requested() -> bool {
        REQUESTED.load(Ordering::SeqCst)
    }

    /// Resets the flag; for tests only.
    #[doc(hidden)]
    pub fn reset() {
        REQUESTED.store(false, Ordering::SeqCst);
    }
}
