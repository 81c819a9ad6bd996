// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Disk metrics for container layers.
//!
//! A quota-enforced container layer sits on its own loop-mounted ext4
//! filesystem, so the used bytes reported by `df` for the layer's diff
//! directory are exactly the container's own writes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use layercake_graph::LayerId;
use layercake_utils::CommandRunner;

use crate::spec::DiskStat;

pub trait Metricser: Send + Sync {
    fn metrics(&self, id: &LayerId) -> io::Result<DiskStat>;
}

/// Adapts an existing disk-usage function and an id-to-path mapping into a
/// [`Metricser`].
pub struct MetricsAdapter {
    usage: Box<UsageFn>,
    id_to_path: Box<PathFn>,
}

type UsageFn = dyn Fn(&Path) -> io::Result<DiskStat> + Send + Sync;
type PathFn = dyn Fn(&LayerId) -> PathBuf + Send + Sync;

impl MetricsAdapter {
    pub fn new(usage: Box<UsageFn>, id_to_path: Box<PathFn>) -> Self {
        MetricsAdapter { usage, id_to_path }
    }
}

impl Metricser for MetricsAdapter {
    fn metrics(&self, id: &LayerId) -> io::Result<DiskStat> {
        (self.usage)(&(self.id_to_path)(id))
    }
}

/// Reads the used bytes of the filesystem backing a layer's diff directory.
pub struct DiffSizeMetricser {
    graph_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DiffSizeMetricser {
    pub fn new<P: AsRef<Path>>(graph_root: P, runner: Arc<dyn CommandRunner>) -> Self {
        DiffSizeMetricser {
            graph_root: graph_root.as_ref().to_path_buf(),
            runner,
        }
    }
}

impl Metricser for DiffSizeMetricser {
    fn metrics(&self, id: &LayerId) -> io::Result<DiskStat> {
        let diff = self
            .graph_root
            .join("aufs")
            .join("diff")
            .join(id.graph_id());
        if !diff.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("get usage: {} does not exist", diff.display()),
            ));
        }

        let output = self
            .runner
            .run(&format!(
                "df -B 1 {} | tail -n1 | awk -v N=3 '{{print $N}}'",
                diff.display()
            ))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("get usage: df: {}", e)))?;

        // an unparsable df line counts as zero usage
        let bytes_used = output.trim().parse::<u64>().unwrap_or(0);
        Ok(DiskStat {
            total_bytes_used: bytes_used,
            exclusive_bytes_used: bytes_used,
        })
    }
}

/// Quotas switched off: every container reports zero usage.
pub struct DisabledMetricser;

impl Metricser for DisabledMetricser {
    fn metrics(&self, _id: &LayerId) -> io::Result<DiskStat> {
        Ok(DiskStat::default())
    }
}
