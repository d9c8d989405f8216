use std::{
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

const PARKED: u8 = 0b01;
const TOKEN: u8 = 0b10;

/// One-token parker. `unpark` before `park` makes the next `park` return
/// immediately; repeated `unpark`s collapse into one token.
#[derive(Debug, Default)]
pub struct NativeParker {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
}

impl NativeParker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn park(&self) {
        self.park_until(None);
    }

    /// Returns `true` if woken by a token, `false` on timeout.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        self.park_until(Some(Instant::now() + timeout))
    }

    fn park_until(&self, deadline: Option<Instant>) -> bool {
        // Fast path: unpark before park => just ignore
        if self.consume_token() {
            return true;
        }

        self.state.fetch_or(PARKED, Release);

        let mut guard = self.lock.lock();
        let woken = loop {
            // checked under the lock: `unpark` notifies while holding it
            if self.consume_token() {
                break true;
            }
            match deadline {
                None => self.cv.wait(&mut guard),
                Some(deadline) => {
                    if self.cv.wait_until(&mut guard, deadline).timed_out() {
                        break self.consume_token();
                    }
                }
            }
        };
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
        woken
    }

    /// Clears a pending token. Returns `true` if one was present.
    #[inline]
    pub fn consume_token(&self) -> bool {
        let mut s = self.state.load(Acquire);
        while s & TOKEN != 0 {
            match self
                .state
                .compare_exchange_weak(s, s & !TOKEN, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn unpark(&self) {
        let prev = self.state.fetch_or(TOKEN, Release);

        if prev & PARKED != 0 {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }
}
