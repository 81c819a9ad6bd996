// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Container layer creation on top of a fetched image.
//!
//! When namespacing is requested, the image is first materialized as a
//! uid/gid-translated copy, created at most once per image under an
//! internal lock and reused across containers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use layercake_fetcher::FetchedImage;
use layercake_graph::{Cake, LayerId};

use crate::spec::{QuotaScope, RootfsSpec};
use crate::{ProvisionError, ProvisionResult};

/// Capability that rewrites file ownership under a path through a uid/gid
/// mapping.
pub trait Namespacer: Send + Sync {
    /// Identifies the mapping; namespaced copies are cached per key.
    fn cache_key(&self) -> String;

    fn namespace(&self, path: &Path) -> io::Result<()>;
}

/// Capability that materializes volume mount points inside a rootfs.
pub trait VolumeCreator: Send + Sync {
    fn create(&self, rootfs: &Path, volume: &str) -> io::Result<()>;
}

pub struct MkdirVolumeCreator;

impl VolumeCreator for MkdirVolumeCreator {
    fn create(&self, rootfs: &Path, volume: &str) -> io::Result<()> {
        fs::create_dir_all(rootfs.join(volume.trim_start_matches('/')))
    }
}

pub trait LayerCreator: Send + Sync {
    /// Create the container layer for `handle` on top of `parent_image`
    /// and return the rootfs path plus the image's environment.
    fn create(
        &self,
        handle: &str,
        parent_image: &FetchedImage,
        spec: &RootfsSpec,
    ) -> ProvisionResult<(PathBuf, Vec<String>)>;
}

pub struct ContainerLayerCreator {
    cake: Arc<dyn Cake>,
    volume_creator: Box<dyn VolumeCreator>,
    namespacer: Box<dyn Namespacer>,
    // serializes namespaced copy-up so concurrent creates of one image
    // never race the copy
    namespacing_lock: Mutex<()>,
}

impl ContainerLayerCreator {
    pub fn new(
        cake: Arc<dyn Cake>,
        volume_creator: Box<dyn VolumeCreator>,
        namespacer: Box<dyn Namespacer>,
    ) -> Self {
        ContainerLayerCreator {
            cake,
            volume_creator,
            namespacer,
            namespacing_lock: Mutex::new(()),
        }
    }

    fn namespace(&self, image_id: LayerId) -> ProvisionResult<LayerId> {
        let namespaced = LayerId::namespaced(image_id.clone(), self.namespacer.cache_key());

        if self.cake.get(&namespaced).is_err() {
            self.create_namespaced(&namespaced, &image_id)?;
        }

        Ok(namespaced)
    }

    fn create_namespaced(&self, id: &LayerId, parent: &LayerId) -> ProvisionResult<()> {
        self.cake.create(id, Some(parent))?;
        let path = self.cake.path(id)?;

        let translated = self.namespacer.namespace(&path);
        // the translation layer is unmounted whether or not the
        // translation worked
        let unmounted = self.cake.unmount(id);

        translated.map_err(ProvisionError::Io)?;
        unmounted?;
        Ok(())
    }
}

impl LayerCreator for ContainerLayerCreator {
    fn create(
        &self,
        handle: &str,
        parent_image: &FetchedImage,
        spec: &RootfsSpec,
    ) -> ProvisionResult<(PathBuf, Vec<String>)> {
        let mut image_id = LayerId::image(parent_image.image_id.clone());

        if spec.namespaced {
            let _guard = self.namespacing_lock.lock().unwrap();
            image_id = self.namespace(image_id)?;
        }

        let container_id = LayerId::container(handle);
        self.cake.create(&container_id, Some(&image_id))?;

        let rootfs = if spec.quota_size > 0 && spec.quota_scope == QuotaScope::Exclusive {
            self.cake.quotaed_path(&container_id, spec.quota_size)?
        } else if spec.quota_size > 0 && spec.quota_scope == QuotaScope::Total {
            self.cake
                .quotaed_path(&container_id, spec.quota_size - parent_image.size)?
        } else {
            self.cake.path(&container_id)?
        };

        for volume in &parent_image.volumes {
            self.volume_creator
                .create(&rootfs, volume)
                .map_err(ProvisionError::Io)?;
        }

        Ok((rootfs, parent_image.env.clone()))
    }
}
