// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Layered rootfs provisioning for containers.
//!
//! The [`CakeOrdinator`] is the single public surface: container creation
//! pulls the image into the layer graph and stacks a writable, optionally
//! quota-enforced and uid/gid-translated, container layer on top; destroy,
//! metrics and garbage collection go through the same synchronization
//! boundary so collection never races creation.

#[macro_use]
extern crate log;

use std::fmt;
use std::io::Error;

use layercake_fetcher::FetchError;
use layercake_graph::GraphError;

pub mod layer_creator;
pub mod metrics;
pub mod ordinator;
pub mod retain;
pub mod setup;
pub mod spec;

pub use layer_creator::{ContainerLayerCreator, LayerCreator, MkdirVolumeCreator, Namespacer, VolumeCreator};
pub use metrics::{DiffSizeMetricser, DisabledMetricser, Metricser, MetricsAdapter};
pub use ordinator::{CakeOrdinator, Gcer};
pub use retain::RetainerWarmup;
pub use setup::{Provider, ProviderConfig};
pub use spec::{DiskStat, QuotaScope, RootfsSpec};

/// Error codes for rootfs provisioning.
#[derive(Debug)]
pub enum ProvisionError {
    Fetch(FetchError),
    Graph(GraphError),
    Io(Error),
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::Fetch(e) => write!(f, "{}", e),
            ProvisionError::Graph(e) => write!(f, "{}", e),
            ProvisionError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProvisionError::Fetch(e) => Some(e),
            ProvisionError::Graph(e) => Some(e),
            ProvisionError::Io(e) => Some(e),
        }
    }
}

impl From<FetchError> for ProvisionError {
    fn from(e: FetchError) -> Self {
        ProvisionError::Fetch(e)
    }
}

impl From<GraphError> for ProvisionError {
    fn from(e: GraphError) -> Self {
        ProvisionError::Graph(e)
    }
}

impl From<Error> for ProvisionError {
    fn from(e: Error) -> Self {
        ProvisionError::Io(e)
    }
}
