// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A byte-budget capped reader.
//!
//! The budget bounds how much of the source a consumer may pull; crossing it
//! yields a typed [`QuotaExceeded`] error that survives passage through
//! decompressors and archive readers, so callers match on the tag rather
//! than on an error message.

use std::error::Error as StdError;
use std::fmt;
use std::io::{Error, ErrorKind, Read, Result};

/// Typed marker for a reader that ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded;

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer size exceeds image quota")
    }
}

impl StdError for QuotaExceeded {}

impl QuotaExceeded {
    pub fn to_io_error() -> Error {
        Error::new(ErrorKind::Other, QuotaExceeded)
    }
}

/// Whether `err` or anything in its cause chain is a [`QuotaExceeded`] tag.
pub fn is_quota_exceeded(err: &Error) -> bool {
    let mut cause: Option<&(dyn StdError + 'static)> = err.get_ref().map(|e| e as _);
    while let Some(e) = cause {
        if e.is::<QuotaExceeded>() {
            return true;
        }
        cause = e.source();
    }
    false
}

/// Passes reads through until the budget is spent, then fails.
///
/// The read buffer is clipped to `budget + 1` bytes so the overflow byte is
/// detected even when the caller hands in a larger buffer.
pub struct QuotaedReader<R> {
    inner: R,
    quota_left: i64,
}

impl<R: Read> QuotaedReader<R> {
    pub fn new(inner: R, quota: i64) -> Self {
        QuotaedReader {
            inner,
            quota_left: quota,
        }
    }

    pub fn quota_left(&self) -> i64 {
        self.quota_left
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for QuotaedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut limit = buf.len();
        if limit as i64 > self.quota_left {
            limit = std::cmp::max(self.quota_left + 1, 0) as usize;
        }

        let n = self.inner.read(&mut buf[..limit])?;
        self.quota_left -= n as i64;

        if self.quota_left < 0 {
            return Err(QuotaExceeded::to_io_error());
        }

        Ok(n)
    }
}
