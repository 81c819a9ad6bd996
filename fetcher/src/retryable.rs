// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Best-effort retry for transient registry failures.

use url::Url;

use layercake_graph::LayerId;

use crate::{FetchResult, FetchedImage, RepositoryFetcher};

const MAX_ATTEMPTS: u32 = 3;

/// Re-invokes the wrapped fetcher on failure, except for terminal errors
/// (quota exceeded, digest mismatch), which no retry can fix.
pub struct RetryableFetcher {
    inner: Box<dyn RepositoryFetcher>,
}

impl RetryableFetcher {
    pub fn new(inner: Box<dyn RepositoryFetcher>) -> Self {
        RetryableFetcher { inner }
    }

    fn retry<T, F>(&self, what: &str, mut call: F) -> FetchResult<T>
    where
        F: FnMut() -> FetchResult<T>,
    {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match call() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    error!("{} attempt {}/{} failed: {}", what, attempt, MAX_ATTEMPTS, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }
}

impl RepositoryFetcher for RetryableFetcher {
    fn fetch(
        &self,
        url: &Url,
        username: &str,
        password: &str,
        disk_quota: i64,
    ) -> FetchResult<FetchedImage> {
        self.retry("fetch", || {
            self.inner.fetch(url, username, password, disk_quota)
        })
    }

    fn fetch_id(&self, url: &Url) -> FetchResult<LayerId> {
        self.retry("fetch-id", || self.inner.fetch_id(url))
    }
}
