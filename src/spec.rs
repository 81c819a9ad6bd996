// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Rootfs provisioning requests and disk accounting types.

use serde::{Deserialize, Serialize};
use url::Url;

/// What a disk quota counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaScope {
    /// The quota covers the container layer plus its image layers.
    Total,
    /// The quota covers only the container's own writes.
    Exclusive,
}

impl Default for QuotaScope {
    fn default() -> Self {
        QuotaScope::Total
    }
}

/// A request for a container root filesystem.
#[derive(Clone, Debug)]
pub struct RootfsSpec {
    pub rootfs: Url,
    pub username: String,
    pub password: String,
    /// Whether to stack the container on a uid/gid-translated copy of the
    /// image.
    pub namespaced: bool,
    /// Disk quota in bytes; zero or negative disables the quota.
    pub quota_size: i64,
    pub quota_scope: QuotaScope,
}

impl RootfsSpec {
    pub fn new(rootfs: Url) -> Self {
        RootfsSpec {
            rootfs,
            username: String::new(),
            password: String::new(),
            namespaced: false,
            quota_size: 0,
            quota_scope: QuotaScope::default(),
        }
    }
}

/// Disk usage of one container, as reported by the metrics capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    pub total_bytes_used: u64,
    pub exclusive_bytes_used: u64,
}
