// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Garbage collection of unused layers.
//!
//! Reclamation walks the graph's leaves and removes parent chains, stopping
//! at retained layers and at layers backing live containers. Anything a
//! survivor depends on survives with it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cake::Cake;
use crate::id::LayerId;
use crate::GraphResult;

/// Thread-safe set of graph ids pinned against collection.
#[derive(Default)]
pub struct Retainer {
    retained: Mutex<HashSet<String>>,
}

impl Retainer {
    pub fn new() -> Self {
        Retainer::default()
    }

    pub fn retain(&self, id: &LayerId) {
        info!("retaining layer {}", id);
        self.retained.lock().unwrap().insert(id.graph_id());
    }

    pub fn check(&self, id: &LayerId) -> bool {
        self.retained.lock().unwrap().contains(&id.graph_id())
    }
}

/// Decides whether the graph has grown enough to be worth collecting.
pub trait Threshold: Send + Sync {
    fn exceeded(&self, cake: &dyn Cake) -> bool;
}

/// Collection switched off: the threshold is never exceeded.
pub struct DisabledThreshold;

impl Threshold for DisabledThreshold {
    fn exceeded(&self, _cake: &dyn Cake) -> bool {
        false
    }
}

/// Compares the graph root's on-disk usage against a byte limit.
pub struct DiskUsageThreshold {
    root: PathBuf,
    threshold_bytes: u64,
}

impl DiskUsageThreshold {
    pub fn new<P: AsRef<Path>>(root: P, threshold_bytes: u64) -> Self {
        DiskUsageThreshold {
            root: root.as_ref().to_path_buf(),
            threshold_bytes,
        }
    }

    fn dir_size(path: &Path) -> u64 {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut total = 0;
        for entry in entries.flatten() {
            match entry.metadata() {
                Ok(md) if md.is_dir() => total += Self::dir_size(&entry.path()),
                Ok(md) => total += md.len(),
                Err(_) => {}
            }
        }
        total
    }
}

impl Threshold for DiskUsageThreshold {
    fn exceeded(&self, _cake: &dyn Cake) -> bool {
        let used = Self::dir_size(&self.root);
        trace!(
            "graph usage {} bytes against threshold {}",
            used,
            self.threshold_bytes
        );
        used > self.threshold_bytes
    }
}

pub struct GarbageCollector {
    threshold: Box<dyn Threshold>,
    retainer: std::sync::Arc<Retainer>,
}

impl GarbageCollector {
    pub fn new(threshold: Box<dyn Threshold>, retainer: std::sync::Arc<Retainer>) -> Self {
        GarbageCollector {
            threshold,
            retainer,
        }
    }

    pub fn gc(&self, cake: &dyn Cake) -> GraphResult<()> {
        info!("gc start");

        if !self.threshold.exceeded(cake) {
            debug!("gc threshold not exceeded");
            return Ok(());
        }

        for id in cake.get_all_leaves()? {
            self.reclaim(cake, &id)?;
        }

        info!("gc finish");
        Ok(())
    }

    fn reclaim(&self, cake: &dyn Cake, id: &LayerId) -> GraphResult<()> {
        if self.retainer.check(id) {
            info!("layer {} is retained", id);
            return Ok(());
        }

        let image = match cake.get(id) {
            Ok(image) => image,
            Err(e) => {
                warn!("gc skipping {}: {}", id, e);
                return Ok(());
            }
        };

        if !image.container.is_empty() {
            debug!("layer {} backs container {}", id, image.container);
            return Ok(());
        }

        cake.remove(id)?;

        if image.parent.is_empty() {
            return Ok(());
        }

        let parent = LayerId::image(image.parent);
        if let Ok(true) = cake.is_leaf(&parent) {
            return self.reclaim(cake, &parent);
        }

        Ok(())
    }
}
