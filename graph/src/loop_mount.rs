// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Loop-mounting of backing files.
//!
//! Unmounting treats "not a mountpoint" as success and retries transient
//! busy errors with a fixed polling interval, so paired mount/unmount
//! sequences leave no loop devices behind.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use layercake_utils::{CommandRunner, Retrier};

use crate::{external, GraphError, GraphResult};

const UNMOUNT_BUDGET: Duration = Duration::from_secs(10);
const UNMOUNT_INTERVAL: Duration = Duration::from_millis(50);

pub struct LoopMounter {
    runner: Arc<dyn CommandRunner>,
    retrier: Retrier,
}

impl LoopMounter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_retrier(runner, Retrier::new(UNMOUNT_BUDGET, UNMOUNT_INTERVAL))
    }

    pub fn with_retrier(runner: Arc<dyn CommandRunner>, retrier: Retrier) -> Self {
        LoopMounter { runner, retrier }
    }

    /// Attach `file` to a loop device and mount it at `dest` as ext4.
    pub fn mount_file(&self, file: &Path, dest: &Path) -> GraphResult<()> {
        fs::create_dir_all(dest)?;

        self.runner
            .run(&format!(
                "mount -t ext4 -o loop {} {}",
                file.display(),
                dest.display()
            ))
            .map_err(|e| external("mount", e))?;

        Ok(())
    }

    /// Release the mount at `path` and its loop device.
    ///
    /// Success when the path is not a mount point; otherwise the unmount is
    /// retried until the budget runs out, swallowing transient busy errors.
    pub fn unmount(&self, path: &Path) -> GraphResult<()> {
        let result = self.retrier.retry(|| match nix::mount::umount(path) {
            Ok(()) => Ok(()),
            Err(errno) => {
                if !self.is_mountpoint(path) {
                    return Ok(());
                }
                Err(std::io::Error::from_raw_os_error(errno as i32))
            }
        });

        result.map_err(|e| GraphError::Busy(format!("unmount {}: {}", path.display(), e)))
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        self.runner
            .run(&format!("mountpoint {}", path.display()))
            .is_ok()
    }
}
