// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The synchronization boundary around the layer graph.
//!
//! Every public operation passes through one readers-writer lock: creates
//! and metrics share the read side so they run in parallel, while destroy
//! and garbage collection take the write side, so collection can never
//! race a creation that is still registering layers.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use layercake_fetcher::RepositoryFetcher;
use layercake_graph::{Cake, GarbageCollector, GraphResult, LayerId};

use crate::layer_creator::LayerCreator;
use crate::metrics::Metricser;
use crate::spec::{DiskStat, QuotaScope, RootfsSpec};
use crate::{ProvisionError, ProvisionResult};

pub trait Gcer: Send + Sync {
    fn gc(&self, cake: &dyn Cake) -> GraphResult<()>;
}

impl Gcer for GarbageCollector {
    fn gc(&self, cake: &dyn Cake) -> GraphResult<()> {
        GarbageCollector::gc(self, cake)
    }
}

/// There should be exactly one ordinator per graph; it owns all mutation.
pub struct CakeOrdinator {
    gate: RwLock<()>,
    cake: Arc<dyn Cake>,
    fetcher: Arc<dyn RepositoryFetcher>,
    layer_creator: Box<dyn LayerCreator>,
    metricser: Box<dyn Metricser>,
    gcer: Box<dyn Gcer>,
}

impl CakeOrdinator {
    pub fn new(
        cake: Arc<dyn Cake>,
        fetcher: Arc<dyn RepositoryFetcher>,
        layer_creator: Box<dyn LayerCreator>,
        metricser: Box<dyn Metricser>,
        gcer: Box<dyn Gcer>,
    ) -> Self {
        CakeOrdinator {
            gate: RwLock::new(()),
            cake,
            fetcher,
            layer_creator,
            metricser,
            gcer,
        }
    }

    /// Fetch the image and stack a container layer on it. Multiple creates
    /// may run in parallel.
    pub fn create(&self, handle: &str, spec: &RootfsSpec) -> ProvisionResult<(PathBuf, Vec<String>)> {
        let _gate = self.gate.read().unwrap();

        // an exclusive quota covers only the container's own writes, so
        // the fetch itself is not budgeted
        let fetcher_quota = if spec.quota_scope == QuotaScope::Exclusive {
            0
        } else {
            spec.quota_size
        };

        let image = self
            .fetcher
            .fetch(&spec.rootfs, &spec.username, &spec.password, fetcher_quota)
            .map_err(ProvisionError::Fetch)?;

        self.layer_creator.create(handle, &image, spec)
    }

    /// Remove the container's layer. Succeeds when the layer is already
    /// gone.
    pub fn destroy(&self, handle: &str) -> ProvisionResult<()> {
        let _gate = self.gate.write().unwrap();

        let id = LayerId::container(handle);
        if let Err(e) = self.cake.get(&id) {
            info!("layer of container {} already deleted: {}", handle, e);
            return Ok(());
        }

        self.cake.remove(&id).map_err(ProvisionError::Graph)
    }

    pub fn metrics(&self, handle: &str) -> ProvisionResult<DiskStat> {
        let _gate = self.gate.read().unwrap();
        self.metricser
            .metrics(&LayerId::container(handle))
            .map_err(ProvisionError::Io)
    }

    /// Collect unused layers. Blocks out every other operation while it
    /// runs.
    pub fn gc(&self) -> ProvisionResult<()> {
        let _gate = self.gate.write().unwrap();
        self.gcer.gc(self.cake.as_ref()).map_err(ProvisionError::Graph)
    }
}
