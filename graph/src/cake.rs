// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The base layer graph ("cake").
//!
//! Layers live under `<root>/aufs`: extracted contents in `diff/<id>`,
//! union mount points in `mnt/<id>`, metadata records in `layers/<id>`.
//! Registration extracts a (possibly gzipped) tar stream into the diff
//! directory and commits the metadata record last, so a layer is either
//! fully present or absent.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use layercake_utils::{is_quota_exceeded, QuotaedReader};

use crate::id::LayerId;
use crate::image::Image;
use crate::quota_driver::QuotaUnionDriver;
use crate::{GraphError, GraphResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub trait Cake: Send + Sync {
    fn driver_name(&self) -> String;

    /// Create an empty layer on top of `parent`.
    fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> GraphResult<()>;

    fn register(&self, image: Image, tar: &mut dyn Read) -> GraphResult<()> {
        self.register_with_quota(image, tar, 0)
    }

    /// Register a layer by extracting `tar` into its diff directory,
    /// bounded by `quota` bytes when positive.
    fn register_with_quota(&self, image: Image, tar: &mut dyn Read, quota: i64)
        -> GraphResult<()>;

    fn get(&self, id: &LayerId) -> GraphResult<Image>;

    /// Remove a layer. Removing a nonexistent layer succeeds.
    fn remove(&self, id: &LayerId) -> GraphResult<()>;

    /// Mount the layer and return the path visible to containers.
    fn path(&self, id: &LayerId) -> GraphResult<PathBuf>;

    /// Like [`Cake::path`], but with a `quota`-byte backing file under the
    /// layer's diff directory.
    fn quotaed_path(&self, id: &LayerId, quota: i64) -> GraphResult<PathBuf>;

    fn unmount(&self, id: &LayerId) -> GraphResult<()>;

    /// All layers that no other layer lists as parent.
    fn get_all_leaves(&self) -> GraphResult<Vec<LayerId>>;

    fn is_leaf(&self, id: &LayerId) -> GraphResult<bool>;
}

pub struct DiskCake {
    root: PathBuf,
    driver: QuotaUnionDriver,
}

impl DiskCake {
    pub fn new(root: PathBuf, driver: QuotaUnionDriver) -> GraphResult<Self> {
        for dir in ["aufs/diff", "aufs/mnt", "aufs/layers"].iter() {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(DiskCake { root, driver })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join("aufs").join("layers")
    }

    fn metadata_path(&self, graph_id: &str) -> PathBuf {
        self.layers_dir().join(graph_id)
    }

    fn read_image(&self, graph_id: &str) -> GraphResult<Image> {
        let data = match fs::read(self.metadata_path(graph_id)) {
            Ok(data) => data,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GraphError::NotFound(graph_id.to_string()))
            }
            Err(e) => return Err(GraphError::Io(e)),
        };

        serde_json::from_slice(&data).map_err(|e| {
            GraphError::Corruption(format!("metadata of layer {}: {}", graph_id, e))
        })
    }

    fn write_image(&self, image: &Image) -> GraphResult<()> {
        let data = serde_json::to_vec(image)
            .map_err(|e| GraphError::Corruption(format!("encoding layer {}: {}", image.id, e)))?;
        fs::write(self.metadata_path(&image.id), data)?;
        Ok(())
    }

    fn layer_exists(&self, graph_id: &str) -> bool {
        self.metadata_path(graph_id).exists()
    }

    fn all_images(&self) -> GraphResult<Vec<Image>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(self.layers_dir())? {
            let entry = entry?;
            let graph_id = entry.file_name().to_string_lossy().to_string();
            images.push(self.read_image(&graph_id)?);
        }
        Ok(images)
    }

    fn check_parent(&self, parent: &str) -> GraphResult<()> {
        if !parent.is_empty() && !self.layer_exists(parent) {
            return Err(GraphError::NotFound(parent.to_string()));
        }
        Ok(())
    }

    /// Undo a half-registered layer: diff contents and driver-side storage.
    fn discard_layer(&self, graph_id: &str) {
        if let Err(e) = self.driver.remove(graph_id) {
            warn!("discarding layer {}: {}", graph_id, e);
        }
        let diff = self.driver.diff_path(graph_id);
        if let Err(e) = fs::remove_dir_all(&diff) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("discarding diff dir {}: {}", diff.display(), e);
            }
        }
    }

    fn extract(&self, diff: &Path, tar: &mut dyn Read, quota: i64) -> std::io::Result<()> {
        let capped: Box<dyn Read + '_> = if quota > 0 {
            Box::new(QuotaedReader::new(tar, quota))
        } else {
            Box::new(tar)
        };

        let mut stream = BufReader::new(capped);
        let gzipped = {
            let head = stream.fill_buf()?;
            head.len() >= 2 && head[..2] == GZIP_MAGIC
        };

        if gzipped {
            let mut archive = Archive::new(GzDecoder::new(stream));
            archive.set_preserve_permissions(true);
            archive.unpack(diff)
        } else {
            let mut archive = Archive::new(stream);
            archive.set_preserve_permissions(true);
            archive.unpack(diff)
        }
    }
}

impl Cake for DiskCake {
    fn driver_name(&self) -> String {
        self.driver.name().to_string()
    }

    fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> GraphResult<()> {
        let graph_id = id.graph_id();
        if self.layer_exists(&graph_id) {
            return Err(GraphError::AlreadyExists(graph_id));
        }

        let parent_gid = parent.map(|p| p.graph_id()).unwrap_or_default();
        self.check_parent(&parent_gid)?;

        self.driver.create(&graph_id, parent.map(|_| parent_gid.as_str()))?;
        fs::create_dir_all(self.driver.diff_path(&graph_id))?;

        let mut image = Image::new(graph_id.clone()).with_parent(parent_gid);
        if let Some(handle) = id.container_handle() {
            image.container = handle.to_string();
        }

        if let Err(e) = self.write_image(&image) {
            self.discard_layer(&graph_id);
            return Err(e);
        }

        debug!("created layer {} on {}", image.id, image.parent);
        Ok(())
    }

    fn register_with_quota(
        &self,
        image: Image,
        tar: &mut dyn Read,
        quota: i64,
    ) -> GraphResult<()> {
        if image.id.is_empty() {
            return Err(GraphError::Corruption("image with empty id".to_string()));
        }
        if self.layer_exists(&image.id) {
            return Err(GraphError::AlreadyExists(image.id));
        }
        self.check_parent(&image.parent)?;

        let parent = if image.parent.is_empty() {
            None
        } else {
            Some(image.parent.as_str())
        };
        self.driver.create(&image.id, parent)?;

        let diff = self.driver.diff_path(&image.id);
        fs::create_dir_all(&diff)?;

        if let Err(e) = self.extract(&diff, tar, quota) {
            self.discard_layer(&image.id);
            if is_quota_exceeded(&e) {
                return Err(GraphError::QuotaExceeded(format!(
                    "extracting layer {}: {}",
                    image.id, e
                )));
            }
            return Err(GraphError::Io(e));
        }

        if let Err(e) = self.write_image(&image) {
            self.discard_layer(&image.id);
            return Err(e);
        }

        debug!("registered layer {} ({} bytes)", image.id, image.size);
        Ok(())
    }

    fn get(&self, id: &LayerId) -> GraphResult<Image> {
        self.read_image(&id.graph_id())
    }

    fn remove(&self, id: &LayerId) -> GraphResult<()> {
        let graph_id = id.graph_id();
        if !self.layer_exists(&graph_id) {
            debug!("remove of missing layer {} is a no-op", graph_id);
            return Ok(());
        }

        self.driver.remove(&graph_id)?;

        let diff = self.driver.diff_path(&graph_id);
        match fs::remove_dir_all(&diff) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GraphError::Io(e)),
        }

        fs::remove_file(self.metadata_path(&graph_id))?;
        Ok(())
    }

    fn path(&self, id: &LayerId) -> GraphResult<PathBuf> {
        self.driver.get(&id.graph_id(), "")
    }

    fn quotaed_path(&self, id: &LayerId, quota: i64) -> GraphResult<PathBuf> {
        self.driver.get_quotaed(&id.graph_id(), "", quota)
    }

    fn unmount(&self, id: &LayerId) -> GraphResult<()> {
        self.driver.put(&id.graph_id())
    }

    fn get_all_leaves(&self) -> GraphResult<Vec<LayerId>> {
        let images = self.all_images()?;
        let leaves = images
            .iter()
            .filter(|img| !images.iter().any(|other| other.parent == img.id))
            .map(|img| LayerId::image(img.id.clone()))
            .collect();
        Ok(leaves)
    }

    fn is_leaf(&self, id: &LayerId) -> GraphResult<bool> {
        let graph_id = id.graph_id();
        Ok(!self
            .all_images()?
            .iter()
            .any(|img| img.parent == graph_id))
    }
}
