//! Small blocking primitives used by the block/resume coordinator.
//!
//! The park protocol needs a lock that one thread can hold while waiting and
//! a *different* thread can release. A mutex guard cannot move between
//! threads, so the primitive is an explicit token semaphore: `acquire` blocks
//! until a token is available and consumes it, `release` adds one from any
//! thread.

use std::sync::Condvar;
use std::sync::Mutex;

pub struct Semaphore {
    tokens: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Semaphore {
        Semaphore {
            tokens: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a token is available, then consume it.
    pub fn acquire(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        while *tokens == 0 {
            tokens = self.cond.wait(tokens).unwrap();
        }
        *tokens -= 1;
    }

    /// Make one token available. May be called from any thread.
    pub fn release(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens += 1;
        self.cond.notify_one();
    }
}

/// One-shot signal for request/reply round-trips (the handler-info fetch in
/// the exception filter). Waiters for the same key share one of these so
/// concurrent requests coalesce into a single wire exchange.
pub struct OneShot {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl OneShot {
    pub fn new() -> OneShot {
        OneShot {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
    }

    pub fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cond.notify_all();
    }
}

impl Default for OneShot {
    fn default() -> OneShot {
        OneShot::new()
    }
}
