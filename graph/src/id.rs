// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Layer identity.
//!
//! A layer is addressed by its graph id: the hex of a SHA-256 digest for
//! image layers, the container handle for writable container layers, and a
//! derived `sha256(parent || cache_key)` for namespaced copies. Two ids are
//! equal iff their graph ids match; all storage keys the graph id.

use std::fmt;
use std::hash::{Hash, Hasher};

use layercake_utils::digest::namespaced_graph_id;

#[derive(Clone, Debug)]
pub enum LayerId {
    /// A content-addressed image layer, identified by its strong-id hex.
    Image(String),
    /// A writable per-container layer, identified by the container handle.
    Container(String),
    /// A uid/gid-translated copy of another layer.
    Namespaced {
        parent: Box<LayerId>,
        cache_key: String,
    },
}

impl LayerId {
    pub fn image<S: Into<String>>(hex: S) -> Self {
        LayerId::Image(hex.into())
    }

    pub fn container<S: Into<String>>(handle: S) -> Self {
        LayerId::Container(handle.into())
    }

    pub fn namespaced<S: Into<String>>(parent: LayerId, cache_key: S) -> Self {
        LayerId::Namespaced {
            parent: Box::new(parent),
            cache_key: cache_key.into(),
        }
    }

    /// The normalized on-disk identity of this layer.
    pub fn graph_id(&self) -> String {
        match self {
            LayerId::Image(hex) => hex.clone(),
            LayerId::Container(handle) => handle.clone(),
            LayerId::Namespaced { parent, cache_key } => {
                namespaced_graph_id(&parent.graph_id(), cache_key)
            }
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(self, LayerId::Namespaced { .. })
    }

    /// The handle of a container layer, if this is one.
    pub fn container_handle(&self) -> Option<&str> {
        match self {
            LayerId::Container(handle) => Some(handle),
            _ => None,
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.graph_id())
    }
}

impl PartialEq for LayerId {
    fn eq(&self, other: &Self) -> bool {
        self.graph_id() == other.graph_id()
    }
}

impl Eq for LayerId {}

impl Hash for LayerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph_id().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_and_container_ids_are_verbatim() {
        assert_eq!(LayerId::image("abcd").graph_id(), "abcd");
        assert_eq!(LayerId::container("handle-1").graph_id(), "handle-1");
    }

    #[test]
    fn test_namespaced_id_is_derived() {
        let parent = LayerId::image("abcd");
        let ns = LayerId::namespaced(parent.clone(), "key1");
        assert_eq!(ns.graph_id(), namespaced_graph_id("abcd", "key1"));
        assert_ne!(ns.graph_id(), parent.graph_id());
    }

    #[test]
    fn test_equality_is_by_graph_id() {
        // a container layer whose handle happens to match an image hex
        assert_eq!(LayerId::image("same"), LayerId::container("same"));

        let ns1 = LayerId::namespaced(LayerId::image("p"), "k");
        let ns2 = LayerId::namespaced(LayerId::image("p"), "k");
        let ns3 = LayerId::namespaced(LayerId::image("p"), "other");
        assert_eq!(ns1, ns2);
        assert_ne!(ns1, ns3);
    }

    #[test]
    fn test_nested_namespacing_chains_the_derivation() {
        let inner = LayerId::namespaced(LayerId::image("p"), "k1");
        let outer = LayerId::namespaced(inner.clone(), "k2");
        assert_eq!(
            outer.graph_id(),
            namespaced_graph_id(&inner.graph_id(), "k2")
        );
    }
}
