// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Schema-1 manifest decoding.
//!
//! The registry serves `fsLayers` top-first together with one
//! `v1Compatibility` history record per layer. Decoding reverses the order
//! so parents come first and derives each layer's strong id from the chain
//! of blob sums: `sha256(parent_strong_id || blob_sum)`.

use std::collections::BTreeMap;

use serde::Deserialize;

use layercake_utils::digest::{chain_id, LayerDigest};

use crate::registry::{RegistryError, RegistryResult};

/// One layer of a resolved manifest, bottom-up ordered within
/// [`Manifest::layers`].
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestLayer {
    pub blob_sum: LayerDigest,
    /// The chain-derived graph id of this layer.
    pub strong_id: String,
    /// Empty for the bottom layer.
    pub parent_strong_id: String,
    pub size: i64,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
}

/// A tagged image resolved from the registry, layers bottom (root) first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    pub layers: Vec<ManifestLayer>,
}

impl Manifest {
    pub fn total_size(&self) -> i64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    /// The graph id of the image: the strong id of the top layer.
    pub fn top_strong_id(&self) -> &str {
        &self
            .layers
            .last()
            .expect("a manifest has at least one layer")
            .strong_id
    }
}

#[derive(Deserialize)]
struct ManifestDoc {
    #[serde(rename = "fsLayers", default)]
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    history: Vec<History>,
}

#[derive(Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Deserialize, Default)]
struct V1Image {
    #[serde(rename = "Size", alias = "size", default)]
    size: i64,
    #[serde(default)]
    config: Option<V1Config>,
}

#[derive(Deserialize, Default)]
struct V1Config {
    #[serde(rename = "Env", alias = "env", default)]
    env: Vec<String>,
    // docker serializes the volume set as a map from path to empty object
    #[serde(rename = "Volumes", alias = "volumes", default)]
    volumes: Option<BTreeMap<String, serde_json::Value>>,
}

pub fn parse(body: &str) -> RegistryResult<Manifest> {
    let doc: ManifestDoc =
        serde_json::from_str(body).map_err(|e| RegistryError::Manifest(e.to_string()))?;

    if doc.fs_layers.is_empty() {
        return Err(RegistryError::Manifest("manifest has no layers".to_string()));
    }
    if doc.fs_layers.len() != doc.history.len() {
        return Err(RegistryError::Manifest(format!(
            "{} fs layers but {} history records",
            doc.fs_layers.len(),
            doc.history.len()
        )));
    }

    let mut layers = Vec::with_capacity(doc.fs_layers.len());
    let mut parent_strong_id = String::new();

    for i in (0..doc.fs_layers.len()).rev() {
        let blob_sum: LayerDigest = doc.fs_layers[i]
            .blob_sum
            .parse()
            .map_err(|e| RegistryError::Manifest(format!("blobSum: {}", e)))?;

        let v1: V1Image = serde_json::from_str(&doc.history[i].v1_compatibility)
            .map_err(|e| RegistryError::Manifest(format!("v1Compatibility: {}", e)))?;

        let strong_id = chain_id(&parent_strong_id, &blob_sum.hex());
        let (env, volumes) = match v1.config {
            Some(config) => (
                config.env,
                config
                    .volumes
                    .map(|v| v.keys().cloned().collect())
                    .unwrap_or_default(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        layers.push(ManifestLayer {
            blob_sum,
            strong_id: strong_id.clone(),
            parent_strong_id: std::mem::replace(&mut parent_strong_id, strong_id),
            size: v1.size,
            env,
            volumes,
        });
    }

    Ok(Manifest { layers })
}
