// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Scheme routing between the remote fetcher and a local one.
//!
//! `docker://` URLs go to the registry; everything else (`file://` trees,
//! plain paths) goes to the injected local fetcher, which lives outside
//! this crate.

use url::Url;

use layercake_graph::LayerId;

use crate::{FetchResult, FetchedImage, RepositoryFetcher};

const DOCKER_SCHEME: &str = "docker";

pub struct CompositeFetcher {
    local: Box<dyn RepositoryFetcher>,
    remote: Box<dyn RepositoryFetcher>,
}

impl CompositeFetcher {
    pub fn new(
        local: Box<dyn RepositoryFetcher>,
        remote: Box<dyn RepositoryFetcher>,
    ) -> Self {
        CompositeFetcher { local, remote }
    }

    fn route(&self, url: &Url) -> &dyn RepositoryFetcher {
        if url.scheme() == DOCKER_SCHEME {
            self.remote.as_ref()
        } else {
            self.local.as_ref()
        }
    }
}

impl RepositoryFetcher for CompositeFetcher {
    fn fetch(
        &self,
        url: &Url,
        username: &str,
        password: &str,
        disk_quota: i64,
    ) -> FetchResult<FetchedImage> {
        self.route(url).fetch(url, username, password, disk_quota)
    }

    fn fetch_id(&self, url: &Url) -> FetchResult<LayerId> {
        self.route(url).fetch_id(url)
    }
}
