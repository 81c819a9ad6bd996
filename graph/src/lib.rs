// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Content-addressed layer graph for container root filesystems.
//!
//! Layers are stored parent-first in an on-disk graph. Container layers may
//! be quota-enforced by mounting a loop-backed ext4 file under the layer's
//! diff directory, and image layers may be copied into uid/gid-translated
//! ("namespaced") variants tracked by a side table next to the graph.

#[macro_use]
extern crate log;
#[macro_use]
extern crate layercake_utils;

use std::fmt;
use std::io::Error;

use layercake_utils::exec::ExecError;

pub mod backing_store;
pub mod cake;
pub mod gc;
pub mod id;
pub mod image;
pub mod loop_mount;
pub mod overlay;
pub mod quota_driver;
pub mod union;


pub use backing_store::BackingStore;
pub use cake::{Cake, DiskCake};
pub use gc::{DisabledThreshold, DiskUsageThreshold, GarbageCollector, Retainer, Threshold};
pub use id::LayerId;
pub use image::Image;
pub use loop_mount::LoopMounter;
pub use overlay::OverlayCake;
pub use quota_driver::{QuotaDriverConfig, QuotaUnionDriver};
pub use union::UnionDriver;

/// Error codes for layer graph operations.
#[derive(Debug)]
pub enum GraphError {
    /// The referenced layer does not exist. Callers may treat this as a
    /// cache miss.
    NotFound(String),
    /// A layer with this graph id already exists.
    AlreadyExists(String),
    /// Registration ran out of the per-image disk budget.
    QuotaExceeded(String),
    /// Graph metadata is inconsistent on disk.
    Corruption(String),
    /// A mount could not be released within the retry budget.
    Busy(String),
    /// A host tool failed; carries the tool's combined output.
    External { tool: String, output: String },
    Io(Error),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::NotFound(id) => write!(f, "layer {} not found", id),
            GraphError::AlreadyExists(id) => write!(f, "layer {} already exists", id),
            GraphError::QuotaExceeded(ctx) => write!(f, "quota exceeded: {}", ctx),
            GraphError::Corruption(msg) => write!(f, "graph corruption: {}", msg),
            GraphError::Busy(msg) => write!(f, "resource busy: {}", msg),
            GraphError::External { tool, output } => {
                write!(f, "{} failed: {}", tool, output.trim_end())
            }
            GraphError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for GraphError {
    fn from(e: Error) -> Self {
        GraphError::Io(e)
    }
}

pub(crate) fn external(tool: &str, err: ExecError) -> GraphError {
    GraphError::External {
        tool: tool.to_string(),
        output: err.to_string(),
    }
}

impl GraphError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }
}
