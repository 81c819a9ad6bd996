// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Remote image fetching.
//!
//! Resolves `docker://` URLs against a v2 registry, verifies every blob
//! against its digest, and registers layers bottom-up into the layer graph,
//! deduplicating concurrent pulls of the same blob.

#[macro_use]
extern crate log;

use std::fmt;
use std::io::Error;

use url::Url;

use layercake_graph::{GraphError, LayerId};

pub mod composite;
pub mod connection;
pub mod lock;
pub mod manifest;
pub mod registry;
pub mod remote;
pub mod retryable;
pub mod verify;


pub use composite::CompositeFetcher;
pub use connection::ConnectionConfig;
pub use lock::FetchLock;
pub use manifest::{Manifest, ManifestLayer};
pub use registry::{Conn, Dialer, RegistryDialer, RegistryError, RegistryResult};
pub use remote::RemoteFetcher;
pub use retryable::RetryableFetcher;
pub use verify::{VerifiedBlob, Verifier};

/// Error codes for image fetching.
#[derive(Debug)]
pub enum FetchError {
    /// Registry or auth failure, with the host and repo for context.
    /// Retriable.
    Registry {
        host: String,
        repo: String,
        cause: RegistryError,
    },
    /// The manifest or a layer read exceeded the per-image disk budget.
    /// Terminal.
    QuotaExceeded,
    /// A blob did not match its digest. Terminal and non-retriable.
    DigestMismatch { expected: String, actual: String },
    Graph(GraphError),
    Io(Error),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

impl FetchError {
    /// Terminal errors must not be retried by wrapping fetchers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchError::QuotaExceeded | FetchError::DigestMismatch { .. }
        )
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Registry { host, repo, cause } => {
                write!(f, "could not fetch image {} from registry {}: {}", repo, host, cause)
            }
            FetchError::QuotaExceeded => write!(f, "disk quota exceeded"),
            FetchError::DigestMismatch { expected, actual } => write!(
                f,
                "digest verification failed: expected {}, got {}",
                expected, actual
            ),
            FetchError::Graph(e) => write!(f, "{}", e),
            FetchError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Graph(e) => Some(e),
            FetchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphError> for FetchError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::QuotaExceeded(_) => FetchError::QuotaExceeded,
            other => FetchError::Graph(other),
        }
    }
}

impl From<Error> for FetchError {
    fn from(e: Error) -> Self {
        if layercake_utils::is_quota_exceeded(&e) {
            FetchError::QuotaExceeded
        } else {
            FetchError::Io(e)
        }
    }
}

/// The result of fetching a tagged image: the graph id of its top layer
/// plus the metadata accumulated over all layers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchedImage {
    pub image_id: String,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    pub size: i64,
}

pub trait RepositoryFetcher: Send + Sync {
    /// Pull the image behind `url` into the graph, bounded by `disk_quota`
    /// bytes when positive, and return its top-layer id and metadata.
    fn fetch(
        &self,
        url: &Url,
        username: &str,
        password: &str,
        disk_quota: i64,
    ) -> FetchResult<FetchedImage>;

    /// Resolve `url` to the image's top-layer id without pulling blobs.
    fn fetch_id(&self, url: &Url) -> FetchResult<LayerId>;
}
