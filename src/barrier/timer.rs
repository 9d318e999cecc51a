//! Barrier Timeout Timer
//!
//! A one-shot timer backed by a short-lived thread that sleeps on a condition
//! variable. Disposing the timer wakes the thread, which then exits without
//! running its callback. Disposal never joins, so a timer may be disposed from
//! its own callback.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::sync::lock;

#[derive(Default)]
struct Signal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// One-shot timer, cancelled on drop.
pub(crate) struct Timer {
    signal: Arc<Signal>,
    deadline: Instant,
}

impl Timer {
    /// Runs `callback` on a timer thread once `deadline` is reached.
    pub(crate) fn schedule<F>(deadline: Instant, callback: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let waiter = Arc::clone(&signal);

        thread::Builder::new()
            .name("asyncmachine-timer".to_string())
            .spawn(move || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let guard = lock(&waiter.cancelled);
                let (guard, _) = waiter
                    .wake
                    .wait_timeout_while(guard, remaining, |cancelled| {
                        !*cancelled && Instant::now() < deadline
                    })
                    .unwrap_or_else(|poisoned| poisoned.into_inner());

                if *guard {
                    trace!("timer cancelled before its deadline");
                    return;
                }
                drop(guard);
                callback();
            })?;

        Ok(Self { signal, deadline })
    }

    /// Time left until the deadline.
    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancels the timer if it has not fired yet.
    pub(crate) fn dispose(&self) {
        *lock(&self.signal.cancelled) = true;
        self.signal.wake.notify_all();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.dispose();
    }
}
