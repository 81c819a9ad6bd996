// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Namespaced-layer support on top of the base cake.
//!
//! A namespaced layer is a uid/gid-translated copy of an image layer. The
//! base graph sees it as a root layer (its diff is populated by a copy-up,
//! not by a union of its parent), so the real parent link is tracked in a
//! side table next to the graph:
//!
//! - `garden-info/parent-child/<parent>`: newline list of child graph ids
//! - `garden-info/child-parent/<child>`: the single parent graph id

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use layercake_utils::CommandRunner;

use crate::cake::Cake;
use crate::id::LayerId;
use crate::image::Image;
use crate::{external, GraphError, GraphResult};

const METADATA_DIR: &str = "garden-info";
const PARENT_CHILD_DIR: &str = "parent-child";
const CHILD_PARENT_DIR: &str = "child-parent";

pub struct OverlayCake<C: Cake> {
    inner: C,
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl<C: Cake> OverlayCake<C> {
    pub fn new(inner: C, runner: Arc<dyn CommandRunner>, root: PathBuf) -> Self {
        OverlayCake { inner, runner, root }
    }

    fn parent_child_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR).join(PARENT_CHILD_DIR)
    }

    fn child_parent_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR).join(CHILD_PARENT_DIR)
    }

    fn has_info(&self, dir: &PathBuf, graph_id: &str) -> bool {
        dir.join(graph_id).exists()
    }

    /// A non-empty side-table file for `graph_id`, if present.
    fn read_info(&self, dir: &PathBuf, graph_id: &str) -> GraphResult<Option<String>> {
        match fs::read_to_string(dir.join(graph_id)) {
            Ok(data) => {
                let trimmed = data.trim().to_string();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed))
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GraphError::Io(e)),
        }
    }

    fn add_info(&self, dir: &PathBuf, file: &str, content: &str) -> GraphResult<()> {
        fs::create_dir_all(dir)?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))?;
        writeln!(handle, "{}", content)?;
        Ok(())
    }

    /// Rewrite the line list without `content`; delete the file if that
    /// leaves it empty, so the parent can become a leaf again.
    fn remove_info(&self, dir: &PathBuf, file: &str, content: &str) -> GraphResult<()> {
        let path = dir.join(file);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(GraphError::Io(e)),
        };

        let remaining: Vec<&str> = data
            .lines()
            .filter(|line| !line.is_empty() && *line != content)
            .collect();

        if remaining.is_empty() {
            fs::remove_file(&path)?;
            return Ok(());
        }

        fs::write(&path, format!("{}\n", remaining.join("\n")))?;
        Ok(())
    }

    fn create_namespaced(&self, id: &LayerId, parent: &LayerId) -> GraphResult<()> {
        let graph_id = id.graph_id();
        let parent_gid = parent.graph_id();

        if self.has_info(&self.child_parent_dir(), &graph_id) {
            return Err(GraphError::AlreadyExists(graph_id));
        }

        // The copy-up populates the diff, so the base graph must not union
        // this layer with its parent: create it as a root layer.
        self.inner.create(id, None)?;
        let destination = self.inner.path(id)?;
        let source = self.inner.path(parent)?;

        self.runner
            .run(&format!(
                "cp -a {}/. {}",
                source.display(),
                destination.display()
            ))
            .map_err(|e| external("cp", e))?;

        self.add_info(&self.parent_child_dir(), &parent_gid, &graph_id)?;
        self.add_info(&self.child_parent_dir(), &graph_id, &parent_gid)?;

        info!("namespaced layer {} copied from {}", graph_id, parent_gid);
        Ok(())
    }
}

impl<C: Cake> Cake for OverlayCake<C> {
    fn driver_name(&self) -> String {
        self.inner.driver_name()
    }

    fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> GraphResult<()> {
        if !id.is_namespaced() {
            return self.inner.create(id, parent);
        }

        let parent = parent.ok_or_else(|| {
            GraphError::Corruption(format!("namespaced layer {} created without a parent", id))
        })?;
        self.create_namespaced(id, parent)
    }

    fn register_with_quota(
        &self,
        image: Image,
        tar: &mut dyn std::io::Read,
        quota: i64,
    ) -> GraphResult<()> {
        self.inner.register_with_quota(image, tar, quota)
    }

    fn get(&self, id: &LayerId) -> GraphResult<Image> {
        let mut image = self.inner.get(id)?;

        if image.parent.is_empty() {
            if let Some(parent) = self.read_info(&self.child_parent_dir(), &id.graph_id())? {
                image.parent = parent;
            }
        }

        Ok(image)
    }

    fn remove(&self, id: &LayerId) -> GraphResult<()> {
        self.inner.remove(id)?;

        let graph_id = id.graph_id();
        let parent = match self.read_info(&self.child_parent_dir(), &graph_id)? {
            Some(parent) => parent,
            None => return Ok(()),
        };

        match fs::remove_file(self.child_parent_dir().join(&graph_id)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(GraphError::Io(e)),
        }

        self.remove_info(&self.parent_child_dir(), &parent, &graph_id)
    }

    fn path(&self, id: &LayerId) -> GraphResult<PathBuf> {
        self.inner.path(id)
    }

    fn quotaed_path(&self, id: &LayerId, quota: i64) -> GraphResult<PathBuf> {
        self.inner.quotaed_path(id, quota)
    }

    fn unmount(&self, id: &LayerId) -> GraphResult<()> {
        self.inner.unmount(id)
    }

    fn get_all_leaves(&self) -> GraphResult<Vec<LayerId>> {
        let mut leaves = Vec::new();
        for id in self.inner.get_all_leaves()? {
            if self
                .read_info(&self.parent_child_dir(), &id.graph_id())?
                .is_none()
            {
                leaves.push(id);
            }
        }
        Ok(leaves)
    }

    fn is_leaf(&self, id: &LayerId) -> GraphResult<bool> {
        if !self.inner.is_leaf(id)? {
            return Ok(false);
        }

        Ok(self
            .read_info(&self.parent_child_dir(), &id.graph_id())?
            .is_none())
    }
}
