// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with a fixed polling interval.
//!
//! The clock is a capability so tests can drive retries without sleeping.

use std::io::Result;
use std::thread;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn sleep(&self, d: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, d: Duration) {
        thread::sleep(d);
    }
}

/// Runs a callback up to `timeout / polling_interval` times, sleeping the
/// interval between attempts, and returns the last error on exhaustion.
pub struct Retrier {
    timeout: Duration,
    polling_interval: Duration,
    clock: Box<dyn Clock>,
}

impl Retrier {
    pub fn new(timeout: Duration, polling_interval: Duration) -> Self {
        Self::with_clock(timeout, polling_interval, Box::new(SystemClock))
    }

    pub fn with_clock(timeout: Duration, polling_interval: Duration, clock: Box<dyn Clock>) -> Self {
        Retrier {
            timeout,
            polling_interval,
            clock,
        }
    }

    pub fn retry<T, F>(&self, mut callback: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let count = std::cmp::max(
            1,
            (self.timeout.as_millis() / self.polling_interval.as_millis().max(1)) as u64,
        );

        let mut last_err = None;
        for attempt in 0..count {
            match callback() {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
            if attempt + 1 < count {
                self.clock.sleep(self.polling_interval);
            }
        }

        Err(last_err.unwrap())
    }
}
