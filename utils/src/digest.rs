// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! SHA-256 digests for layer blobs and graph ids.
//!
//! Every identifier in the layer graph is the hex of a SHA-256 digest: blob
//! sums as served by the registry, chain-derived strong ids and the ids of
//! namespaced layer copies.

use std::fmt;
use std::io::{Error, Read, Result};
use std::str::FromStr;

use sha2::digest::Digest;
use sha2::Sha256;

pub const DIGEST_LENGTH: usize = 32;
pub const DIGEST_PREFIX: &str = "sha256:";

type DigestData = [u8; DIGEST_LENGTH];

/// A SHA-256 digest value, displayed as bare hex.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default)]
pub struct LayerDigest {
    data: DigestData,
}

impl LayerDigest {
    pub fn from_buf(buf: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(buf);
        LayerDigest {
            data: hasher.finalize().into(),
        }
    }

    /// Digest an entire stream. Returns the digest and the number of bytes read.
    pub fn from_reader<R: Read>(r: &mut R) -> Result<(Self, u64)> {
        let mut hasher = DigestHasher::new();
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((hasher.finalize(), total))
    }

    pub fn hex(&self) -> String {
        self.to_string()
    }

    /// The `sha256:<hex>` form used on the registry wire.
    pub fn to_registry_string(&self) -> String {
        format!("{}{}", DIGEST_PREFIX, self)
    }
}

/// Incremental SHA-256 accumulator.
pub struct DigestHasher {
    inner: Sha256,
}

impl DigestHasher {
    pub fn new() -> Self {
        DigestHasher {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf);
    }

    pub fn finalize(self) -> LayerDigest {
        LayerDigest {
            data: self.inner.finalize().into(),
        }
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.data {
            write!(f, "{:02x}", c)?;
        }
        Ok(())
    }
}

impl FromStr for LayerDigest {
    type Err = Error;

    /// Accepts bare hex or the `sha256:<hex>` wire form.
    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix(DIGEST_PREFIX).unwrap_or(s);
        if hex.len() != DIGEST_LENGTH * 2 {
            return Err(einval!(format!("invalid digest length: {}", s)));
        }
        let mut data = [0u8; DIGEST_LENGTH];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| einval!(format!("invalid digest hex: {}", s)))?;
        }
        Ok(LayerDigest { data })
    }
}

impl AsRef<[u8]> for LayerDigest {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Derive the strong id of a layer from its parent's strong id and its blob
/// sum: `sha256(parent_hex || blob_hex)`, `sha256(blob_hex)` for the bottom
/// layer.
pub fn chain_id(parent_hex: &str, blob_hex: &str) -> String {
    let mut hasher = DigestHasher::new();
    hasher.update(parent_hex.as_bytes());
    hasher.update(blob_hex.as_bytes());
    hasher.finalize().hex()
}

/// Derive the graph id of a uid/gid-translated copy of `parent_graph_id`:
/// `sha256(parent || cache_key)`.
pub fn namespaced_graph_id(parent_graph_id: &str, cache_key: &str) -> String {
    let mut hasher = DigestHasher::new();
    hasher.update(parent_graph_id.as_bytes());
    hasher.update(cache_key.as_bytes());
    hasher.finalize().hex()
}
