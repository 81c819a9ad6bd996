// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the full provisioning stack.
//!
//! The graph and the quota driver reference the same graph root, so they
//! must be built in one pass: backing store and loop mounter first, the
//! quota driver around the injected union driver, the base cake on top of
//! that, then the overlay adapter, and only then the fetcher and ordinator
//! that share the finished cake.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use layercake_fetcher::{
    ConnectionConfig, Dialer, RemoteFetcher, RepositoryFetcher, RetryableFetcher, Verifier,
};
use layercake_graph::{
    BackingStore, Cake, DisabledThreshold, DiskCake, DiskUsageThreshold, GarbageCollector,
    LoopMounter, OverlayCake, QuotaDriverConfig, QuotaUnionDriver, Retainer, Threshold,
    UnionDriver,
};
use layercake_utils::CommandRunner;

use crate::layer_creator::{ContainerLayerCreator, MkdirVolumeCreator, Namespacer};
use crate::metrics::DiffSizeMetricser;
use crate::ordinator::CakeOrdinator;
use crate::retain::RetainerWarmup;
use crate::{ProvisionError, ProvisionResult};

fn default_graph_root() -> PathBuf {
    PathBuf::from("/var/lib/layercake")
}

fn default_registry_host() -> String {
    "registry-1.docker.io".to_string()
}

fn default_gc_threshold() -> i64 {
    -1
}

/// Configuration of the provisioning stack.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub graph_root: PathBuf,
    /// Backing files for quota-enforced layers; defaults to
    /// `<graph_root>/backing_stores`.
    pub backing_store_root: Option<PathBuf>,
    pub default_registry_host: String,
    /// Graph usage in bytes above which gc reclaims layers; negative
    /// disables collection.
    pub gc_threshold_bytes: i64,
    /// Image URLs pinned against collection at startup.
    pub persistent_images: Vec<String>,
    pub connection: ConnectionConfig,
    pub quota_driver: QuotaDriverConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            graph_root: default_graph_root(),
            backing_store_root: None,
            default_registry_host: default_registry_host(),
            gc_threshold_bytes: default_gc_threshold(),
            persistent_images: Vec::new(),
            connection: ConnectionConfig::default(),
            quota_driver: QuotaDriverConfig::default(),
        }
    }
}

impl ProviderConfig {
    fn backing_store_root(&self) -> PathBuf {
        self.backing_store_root
            .clone()
            .unwrap_or_else(|| self.graph_root.join("backing_stores"))
    }
}

/// The assembled stack.
pub struct Provider {
    pub ordinator: CakeOrdinator,
    pub retainer: Arc<Retainer>,
    /// Running while persistent images are still being pinned.
    pub warmup: Option<RetainerWarmup>,
}

impl Provider {
    /// Build the stack over the injected capabilities.
    pub fn build(
        config: ProviderConfig,
        union_driver: Box<dyn UnionDriver>,
        dialer: Box<dyn Dialer>,
        namespacer: Box<dyn Namespacer>,
        runner: Arc<dyn CommandRunner>,
    ) -> ProvisionResult<Provider> {
        let persistent_images = parse_image_urls(&config.persistent_images)?;

        let backing_store = BackingStore::new(config.backing_store_root(), runner.clone());
        let loop_mounter = LoopMounter::new(runner.clone());
        let quota_driver = QuotaUnionDriver::with_config(
            union_driver,
            backing_store,
            loop_mounter,
            runner.clone(),
            config.graph_root.clone(),
            config.quota_driver.clone(),
            Box::new(layercake_utils::SystemClock),
        );

        let base = DiskCake::new(config.graph_root.clone(), quota_driver)?;
        let cake: Arc<dyn Cake> = Arc::new(OverlayCake::new(
            base,
            runner.clone(),
            config.graph_root.clone(),
        ));

        let retainer = Arc::new(Retainer::new());
        let threshold: Box<dyn Threshold> = if config.gc_threshold_bytes < 0 {
            Box::new(DisabledThreshold)
        } else {
            Box::new(DiskUsageThreshold::new(
                &config.graph_root,
                config.gc_threshold_bytes as u64,
            ))
        };
        let gc = GarbageCollector::new(threshold, retainer.clone());

        let remote = RemoteFetcher::new(
            &config.default_registry_host,
            dialer,
            cake.clone(),
            Verifier::new(),
        );
        let fetcher: Arc<dyn RepositoryFetcher> =
            Arc::new(RetryableFetcher::new(Box::new(remote)));

        let warmup = if persistent_images.is_empty() {
            None
        } else {
            Some(RetainerWarmup::start(
                retainer.clone(),
                fetcher.clone(),
                persistent_images,
            ))
        };

        let layer_creator = ContainerLayerCreator::new(
            cake.clone(),
            Box::new(MkdirVolumeCreator),
            namespacer,
        );
        let metricser = DiffSizeMetricser::new(&config.graph_root, runner);

        let ordinator = CakeOrdinator::new(
            cake,
            fetcher,
            Box::new(layer_creator),
            Box::new(metricser),
            Box::new(gc),
        );

        Ok(Provider {
            ordinator,
            retainer,
            warmup,
        })
    }
}

fn parse_image_urls(urls: &[String]) -> ProvisionResult<Vec<Url>> {
    urls.iter()
        .map(|u| {
            Url::parse(u).map_err(|e| {
                ProvisionError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid persistent image url {}: {}", u, e),
                ))
            })
        })
        .collect()
}
