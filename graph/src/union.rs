// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Capability trait for the union filesystem driver sitting below the quota
//! wrapper. Concrete drivers (aufs, overlayfs) live outside this crate.

use std::path::PathBuf;

use crate::GraphResult;

pub trait UnionDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Create the driver-side storage for a layer on top of `parent`.
    fn create(&self, id: &str, parent: Option<&str>) -> GraphResult<()>;

    /// Materialize the layer's union mount and return the mount point.
    fn get(&self, id: &str, mount_label: &str) -> GraphResult<PathBuf>;

    /// Release the union mount. Drivers may report a non-fatal busy status.
    fn put(&self, id: &str) -> GraphResult<()>;

    /// Delete the layer's storage.
    fn remove(&self, id: &str) -> GraphResult<()>;

    fn exists(&self, id: &str) -> bool;
}
