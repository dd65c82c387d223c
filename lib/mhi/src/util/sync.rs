// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking synchronisation helpers shared by the controller and channels.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const COMPLETE_ALL: u32 = u32::MAX;

/// One-shot (re-armable) completion.
///
/// Each `complete()` releases a single waiter; `complete_all()` releases every
/// current and future waiter until the completion is re-armed.
pub struct Completion {
    done: Mutex<u32>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self { done: Mutex::new(0), cv: Condvar::new() }
    }

    pub fn reinit(&self) {
        *self.done.lock().unwrap() = 0;
    }

    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap();
        if *done != COMPLETE_ALL {
            *done += 1;
        }
        self.cv.notify_one();
    }

    pub fn complete_all(&self) {
        *self.done.lock().unwrap() = COMPLETE_ALL;
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock().unwrap() != 0
    }

    /// Wait for the completion to be signalled, for at most `timeout`.
    ///
    /// Returns `false` if the wait expired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap();
        let (mut guard, res) = self
            .cv
            .wait_timeout_while(guard, timeout, |done| *done == 0)
            .unwrap();
        if res.timed_out() && *guard == 0 {
            return false;
        }
        if *guard != COMPLETE_ALL {
            *guard -= 1;
        }
        true
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait queue for conditions evaluated outside of any lock it owns.
///
/// Wakers bump a generation count; waiters re-check their predicate each
/// time the generation moves.
#[derive(Default)]
pub struct WaitQueue {
    gen: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        *self.gen.lock().unwrap() += 1;
        self.cv.notify_all();
    }

    /// Wait until `cond` holds, for at most `timeout`.
    ///
    /// Returns the final evaluation of `cond`.
    pub fn wait_until(
        &self,
        timeout: Duration,
        mut cond: impl FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.gen.lock().unwrap();
            if cond() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let guard = self.gen.lock().unwrap();
            let _ = self
                .cv
                .wait_timeout_while(guard, deadline - now, |gen| *gen == seen)
                .unwrap();
        }
    }
}
