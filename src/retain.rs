// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Warm-up pinning of persistent images.
//!
//! Operator-configured images must survive garbage collection even before
//! anything uses them. The warm-up resolves each image URL to its top-layer
//! id on a background thread and pins it in the retainer. The handle
//! cancels the remaining work when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use url::Url;

use layercake_fetcher::RepositoryFetcher;
use layercake_graph::Retainer;

pub struct RetainerWarmup {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RetainerWarmup {
    pub fn start(
        retainer: Arc<Retainer>,
        fetcher: Arc<dyn RepositoryFetcher>,
        urls: Vec<Url>,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        let handle = thread::spawn(move || {
            for url in urls {
                if flag.load(Ordering::SeqCst) {
                    debug!("retainer warm-up cancelled");
                    return;
                }
                match fetcher.fetch_id(&url) {
                    Ok(id) => retainer.retain(&id),
                    Err(e) => warn!("could not resolve persistent image {}: {}", url, e),
                }
            }
        });

        RetainerWarmup {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop resolving after the in-flight image, if any.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Block until the warm-up thread exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetainerWarmup {
    fn drop(&mut self) {
        self.cancel();
    }
}
