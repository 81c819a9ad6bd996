// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Quota enforcement on top of the union driver.
//!
//! A quota-enforced layer stacks three resources: an ext4 backing file, a
//! loop mount of that file under the layer's diff directory, and the union
//! mount above it. Teardown order is a hard invariant: union unmount, then
//! loop unmount, then backing file deletion. Reversing it corrupts the ext4
//! image or leaks a loop device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use layercake_utils::{Clock, CommandRunner, SystemClock};

use crate::backing_store::BackingStore;
use crate::loop_mount::LoopMounter;
use crate::union::UnionDriver;
use crate::{GraphError, GraphResult};

fn default_unmount_retry_count() -> u32 {
    500
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Tuning for the union unmount poll in [`QuotaUnionDriver::put`].
///
/// The retry bound differs between deployments; 500 iterations at 50 ms is
/// the conservative default.
#[derive(Clone, Debug, Deserialize)]
pub struct QuotaDriverConfig {
    #[serde(default = "default_unmount_retry_count")]
    pub unmount_retry_count: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QuotaDriverConfig {
    fn default() -> Self {
        QuotaDriverConfig {
            unmount_retry_count: default_unmount_retry_count(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QuotaDriverConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub struct QuotaUnionDriver {
    inner: Box<dyn UnionDriver>,
    backing_store: BackingStore,
    loop_mounter: LoopMounter,
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    config: QuotaDriverConfig,
    clock: Box<dyn Clock>,
}

impl QuotaUnionDriver {
    pub fn new(
        inner: Box<dyn UnionDriver>,
        backing_store: BackingStore,
        loop_mounter: LoopMounter,
        runner: Arc<dyn CommandRunner>,
        root: PathBuf,
    ) -> Self {
        Self::with_config(
            inner,
            backing_store,
            loop_mounter,
            runner,
            root,
            QuotaDriverConfig::default(),
            Box::new(SystemClock),
        )
    }

    pub fn with_config(
        inner: Box<dyn UnionDriver>,
        backing_store: BackingStore,
        loop_mounter: LoopMounter,
        runner: Arc<dyn CommandRunner>,
        root: PathBuf,
        config: QuotaDriverConfig,
        clock: Box<dyn Clock>,
    ) -> Self {
        QuotaUnionDriver {
            inner,
            backing_store,
            loop_mounter,
            runner,
            root,
            config,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn diff_path(&self, id: &str) -> PathBuf {
        self.root.join("aufs").join("diff").join(id)
    }

    pub fn mnt_path(&self, id: &str) -> PathBuf {
        self.root.join("aufs").join("mnt").join(id)
    }

    pub fn create(&self, id: &str, parent: Option<&str>) -> GraphResult<()> {
        self.inner.create(id, parent)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    pub fn get(&self, id: &str, mount_label: &str) -> GraphResult<PathBuf> {
        self.inner.get(id, mount_label)
    }

    /// Mount the layer with a `quota`-byte backing file under its diff
    /// directory and return the union mount point.
    pub fn get_quotaed(&self, id: &str, mount_label: &str, quota: i64) -> GraphResult<PathBuf> {
        let bs_path = self.backing_store.create(id, quota)?;

        let diff = self.diff_path(id);
        if let Err(err) = self.loop_mounter.mount_file(&bs_path, &diff) {
            if let Err(e) = self.backing_store.delete(id) {
                error!("cleaning up backing store for {} after failed mount: {}", id, e);
            }
            return Err(err);
        }

        match self.inner.get(id, mount_label) {
            Ok(mnt) => Ok(mnt),
            Err(err) => {
                if let Err(e) = self.loop_mounter.unmount(&diff) {
                    error!("unmounting loop device for {} after failed get: {}", id, e);
                }
                if let Err(e) = self.backing_store.delete(id) {
                    error!("cleaning up backing store for {} after failed get: {}", id, e);
                }
                Err(err)
            }
        }
    }

    /// Release the layer's mounts and backing file, in the mandated order.
    pub fn put(&self, id: &str) -> GraphResult<()> {
        // The union driver sometimes reports a non-fatal busy status.
        if let Err(e) = self.inner.put(id) {
            debug!("union put of {} reported: {}", id, e);
        }

        let mnt = self.mnt_path(id);
        let mut still_mounted = self.is_mountpoint(&mnt);
        let mut attempts = 0;
        while still_mounted && attempts < self.config.unmount_retry_count {
            if let Err(errno) = nix::mount::umount(&mnt) {
                trace!("unmount {} attempt {}: {}", mnt.display(), attempts, errno);
            }
            self.clock.sleep(self.config.poll_interval());
            still_mounted = self.is_mountpoint(&mnt);
            attempts += 1;
        }

        if still_mounted {
            return Err(GraphError::Busy(format!(
                "{} is still a mountpoint after {} attempts",
                mnt.display(),
                attempts
            )));
        }

        self.loop_mounter.unmount(&self.diff_path(id))?;
        self.backing_store.delete(id)?;

        Ok(())
    }

    /// Full teardown followed by driver-side removal.
    pub fn remove(&self, id: &str) -> GraphResult<()> {
        self.put(id)?;
        self.inner.remove(id)
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        self.runner
            .run(&format!("mountpoint {}", path.display()))
            .is_ok()
    }
}
