//! Producer/driver wakeup
//!
//! The driver thread parks on a [`Waiter`] when every queue is idle and is
//! woken by any enqueue or by shutdown. A plain mutex-and-condvar pair;
//! notifications are sticky until consumed, so a notify that races a wait
//! is never lost.

use std::sync::{Condvar, Mutex};

/// One-shot, re-armable wakeup signal.
pub struct Waiter {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    /// Create an un-notified waiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Block until notified, then re-arm.
    pub fn wait(&self) {
        let mut notified = self.notified.lock().expect("waiter mutex poisoned");
        while !*notified {
            notified = self
                .condvar
                .wait(notified)
                .expect("waiter mutex poisoned");
        }
        *notified = false;
    }

    /// Wake the waiting thread (or the next call to [`Self::wait`]).
    pub fn notify(&self) {
        let mut notified = self.notified.lock().expect("waiter mutex poisoned");
        *notified = true;
        self.condvar.notify_all();
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let waiter = Waiter::new();
        waiter.notify();
        waiter.wait(); // returns immediately
    }

    #[test]
    fn wait_blocks_until_notify() {
        let waiter = Arc::new(Waiter::new());
        let handle = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || waiter.wait())
        };

        thread::sleep(Duration::from_millis(20));
        waiter.notify();
        handle.join().unwrap();
    }
}
