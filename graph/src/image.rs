// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-layer metadata records, stored as JSON in the graph.

use serde::{Deserialize, Serialize};

/// Metadata record for one layer in the graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// The layer's own graph id.
    pub id: String,
    /// The parent graph id; empty for root layers.
    #[serde(default)]
    pub parent: String,
    /// Uncompressed extracted size in bytes, when known.
    #[serde(default)]
    pub size: i64,
    /// Non-empty iff this layer backs a live container; such layers are
    /// pinned against garbage collection.
    #[serde(default)]
    pub container: String,
}

impl Image {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Image {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_parent<S: Into<String>>(mut self, parent: S) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }
}
