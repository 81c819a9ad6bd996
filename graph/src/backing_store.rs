// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-layer quota backing files.
//!
//! Each quota-enforced layer gets a sparse file of exactly the quota size,
//! formatted as ext4 and later loop-mounted under the layer's diff
//! directory so writes past the quota fail at the filesystem level.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use layercake_utils::CommandRunner;

use crate::{external, GraphError, GraphResult};

pub struct BackingStore {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl BackingStore {
    pub fn new<P: AsRef<Path>>(root: P, runner: Arc<dyn CommandRunner>) -> Self {
        BackingStore {
            root: root.as_ref().to_path_buf(),
            runner,
        }
    }

    /// Create a sparse ext4 file of exactly `quota` bytes for `id`.
    ///
    /// Fails before touching disk when the quota is not positive. A failure
    /// after the file exists does not roll back; the caller compensates
    /// with [`BackingStore::delete`].
    pub fn create(&self, id: &str, quota: i64) -> GraphResult<PathBuf> {
        if quota <= 0 {
            return Err(GraphError::Io(einval!(format!(
                "cannot create a backing store with quota {}",
                quota
            ))));
        }

        let path = self.path(id);
        fs::create_dir_all(&self.root)?;

        let f = File::create(&path)?;
        f.set_len(quota as u64)?;
        drop(f);

        self.runner
            .run(&format!("mkfs.ext4 -F {}", path.display()))
            .map_err(|e| external("mkfs.ext4", e))?;

        Ok(path)
    }

    /// Best-effort removal; succeeds when the file does not exist.
    pub fn delete(&self, id: &str) -> GraphResult<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GraphError::Io(e)),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}
