// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end provisioning over the assembled stack: fetch, create,
//! metrics, destroy and garbage collection against a scratch graph, with
//! the host-facing capabilities (union driver, registry, mount tools,
//! uid/gid translation) stubbed at their trait seams.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use url::Url;

use layercake::{Provider, ProviderConfig, QuotaScope, RootfsSpec};
use layercake_fetcher::{Conn, Dialer, Manifest, ManifestLayer, RegistryError, RegistryResult};
use layercake_graph::{GraphResult, UnionDriver};
use layercake_utils::digest::{chain_id, LayerDigest};
use layercake_utils::exec::{CommandRunner, ExecError, ExecResult};
use layercake_utils::ShellRunner;

use vmm_sys_util::tempdir::TempDir;

/// Union driver over plain directories: the diff directory doubles as the
/// union mount point.
struct DirUnionDriver {
    root: PathBuf,
}

impl DirUnionDriver {
    fn diff(&self, id: &str) -> PathBuf {
        self.root.join("aufs").join("diff").join(id)
    }
}

impl UnionDriver for DirUnionDriver {
    fn name(&self) -> &str {
        "dir"
    }

    fn create(&self, id: &str, _parent: Option<&str>) -> GraphResult<()> {
        fs::create_dir_all(self.diff(id))?;
        Ok(())
    }

    fn get(&self, id: &str, _mount_label: &str) -> GraphResult<PathBuf> {
        Ok(self.diff(id))
    }

    fn put(&self, _id: &str) -> GraphResult<()> {
        Ok(())
    }

    fn remove(&self, id: &str) -> GraphResult<()> {
        match fs::remove_dir_all(self.diff(id)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.diff(id).exists()
    }
}

/// Answers the host commands the stack issues without touching real
/// mounts; copies still run so namespaced layers get real contents.
struct HostStub {
    shell: ShellRunner,
}

impl CommandRunner for HostStub {
    fn run(&self, cmd: &str) -> ExecResult<String> {
        if cmd.starts_with("cp -a ") {
            return self.shell.run(cmd);
        }
        if cmd.starts_with("mountpoint ") {
            return Err(ExecError::failed(Some(1), "not a mountpoint".to_string()));
        }
        if cmd.starts_with("df -B 1 ") {
            return Ok("8192\n".to_string());
        }
        // mkfs.ext4 and mount succeed silently
        Ok(String::new())
    }
}

struct RegistryState {
    manifest: Manifest,
    blobs: HashMap<String, Vec<u8>>,
    blob_reads: Mutex<HashMap<String, usize>>,
}

struct StubDialer {
    state: Arc<RegistryState>,
}

impl Dialer for StubDialer {
    fn dial(
        &self,
        _host: &str,
        _repo: &str,
        _username: &str,
        _password: &str,
    ) -> RegistryResult<Box<dyn Conn>> {
        Ok(Box::new(StubConn {
            state: self.state.clone(),
        }))
    }
}

struct StubConn {
    state: Arc<RegistryState>,
}

impl Conn for StubConn {
    fn get_manifest(&self, _tag: &str) -> RegistryResult<Manifest> {
        Ok(self.state.manifest.clone())
    }

    fn get_blob_reader(&self, digest: &LayerDigest) -> RegistryResult<Box<dyn Read + Send>> {
        *self
            .state
            .blob_reads
            .lock()
            .unwrap()
            .entry(digest.hex())
            .or_insert(0) += 1;
        let data = self
            .state
            .blobs
            .get(&digest.hex())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

struct RecordingNamespacer {
    translated: Mutex<Vec<PathBuf>>,
}

impl layercake::Namespacer for RecordingNamespacer {
    fn cache_key(&self) -> String {
        "0-65535".to_string()
    }

    fn namespace(&self, path: &Path) -> std::io::Result<()> {
        self.translated.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

fn tar_with_file(path: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    if let Some(pos) = path.rfind('/') {
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder
            .append_data(&mut dir, format!("{}/", &path[..pos]), &[][..])
            .unwrap();
    }
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
    builder.into_inner().unwrap()
}

/// Two layers, bottom-first, as the fetcher expects them.
fn registry() -> Arc<RegistryState> {
    let bottom_tar = tar_with_file("bin/sh", b"#!/bin/sh\n");
    let top_tar = tar_with_file("etc/hosts", b"127.0.0.1 localhost\n");

    let mut blobs = HashMap::new();
    let mut layers = Vec::new();
    let mut parent = String::new();

    for (tar, size, env, volumes) in [
        (bottom_tar, 10i64, vec!["PATH=/bin".to_string()], vec![]),
        (
            top_tar,
            2,
            vec!["HOME=/root".to_string()],
            vec!["/data".to_string()],
        ),
    ] {
        let blob_sum = LayerDigest::from_buf(&tar);
        let strong_id = chain_id(&parent, &blob_sum.hex());
        blobs.insert(blob_sum.hex(), tar);
        layers.push(ManifestLayer {
            blob_sum,
            strong_id: strong_id.clone(),
            parent_strong_id: std::mem::replace(&mut parent, strong_id),
            size,
            env,
            volumes,
        });
    }

    Arc::new(RegistryState {
        manifest: Manifest { layers },
        blobs,
        blob_reads: Mutex::new(HashMap::new()),
    })
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    state: Arc<RegistryState>,
    provider: Provider,
    namespacer: Arc<RecordingNamespacer>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.as_path().to_path_buf();
    let state = registry();
    let namespacer = Arc::new(RecordingNamespacer {
        translated: Mutex::new(Vec::new()),
    });

    struct SharedNamespacer(Arc<RecordingNamespacer>);
    impl layercake::Namespacer for SharedNamespacer {
        fn cache_key(&self) -> String {
            self.0.cache_key()
        }
        fn namespace(&self, path: &Path) -> std::io::Result<()> {
            self.0.namespace(path)
        }
    }

    let provider = Provider::build(
        ProviderConfig {
            graph_root: root.clone(),
            gc_threshold_bytes: 0,
            ..Default::default()
        },
        Box::new(DirUnionDriver { root: root.clone() }),
        Box::new(StubDialer {
            state: state.clone(),
        }),
        Box::new(SharedNamespacer(namespacer.clone())),
        Arc::new(HostStub { shell: ShellRunner }),
    )
    .unwrap();

    Fixture {
        _dir: dir,
        root,
        state,
        provider,
        namespacer,
    }
}

fn spec() -> RootfsSpec {
    RootfsSpec::new(Url::parse("docker:///busybox#1.24.0").unwrap())
}

fn layer_metadata_exists(root: &Path, strong_id: &str) -> bool {
    root.join("aufs/layers").join(strong_id).exists()
}

#[test]
fn test_create_extracts_the_image_and_returns_env() {
    let fx = fixture();

    let (rootfs, env) = fx.provider.ordinator.create("c1", &spec()).unwrap();
    assert_eq!(rootfs, fx.root.join("aufs/diff/c1"));
    assert_eq!(
        env,
        vec!["PATH=/bin".to_string(), "HOME=/root".to_string()]
    );

    // both image layers landed in the graph
    for layer in &fx.state.manifest.layers {
        assert!(layer_metadata_exists(&fx.root, &layer.strong_id));
        assert!(fx
            .root
            .join("aufs/diff")
            .join(&layer.strong_id)
            .exists());
    }

    // the top layer's volume exists inside the rootfs
    assert!(rootfs.join("data").is_dir());
}

#[test]
fn test_second_create_reuses_the_downloaded_layers() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    fx.provider.ordinator.create("c2", &spec()).unwrap();

    for layer in &fx.state.manifest.layers {
        let reads = *fx
            .state
            .blob_reads
            .lock()
            .unwrap()
            .get(&layer.blob_sum.hex())
            .unwrap();
        assert_eq!(reads, 1, "blob {} fetched more than once", layer.blob_sum);
    }
}

#[test]
fn test_metrics_report_the_backing_filesystem_usage() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    let stat = fx.provider.ordinator.metrics("c1").unwrap();
    assert_eq!(stat.exclusive_bytes_used, 8192);
}

#[test]
fn test_quotaed_create_places_a_backing_store() {
    let fx = fixture();

    let mut quotaed = spec();
    quotaed.quota_size = 10 * 1024 * 1024;
    quotaed.quota_scope = QuotaScope::Exclusive;

    fx.provider.ordinator.create("c1", &quotaed).unwrap();
    let backing = fx.root.join("backing_stores/c1");
    assert!(backing.exists());
    assert_eq!(fs::metadata(&backing).unwrap().len(), 10 * 1024 * 1024);

    fx.provider.ordinator.destroy("c1").unwrap();
    assert!(!backing.exists());
}

#[test]
fn test_destroy_is_idempotent() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    fx.provider.ordinator.destroy("c1").unwrap();
    assert!(!layer_metadata_exists(&fx.root, "c1"));
    fx.provider.ordinator.destroy("c1").unwrap();
    fx.provider.ordinator.destroy("never-created").unwrap();
}

#[test]
fn test_gc_spares_layers_under_live_containers() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    fx.provider.ordinator.create("c2", &spec()).unwrap();
    fx.provider.ordinator.destroy("c1").unwrap();

    fx.provider.ordinator.gc().unwrap();
    for layer in &fx.state.manifest.layers {
        assert!(layer_metadata_exists(&fx.root, &layer.strong_id));
    }
}

#[test]
fn test_gc_reclaims_unused_parent_chains() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    fx.provider.ordinator.destroy("c1").unwrap();

    fx.provider.ordinator.gc().unwrap();
    for layer in &fx.state.manifest.layers {
        assert!(
            !layer_metadata_exists(&fx.root, &layer.strong_id),
            "layer {} should have been collected",
            layer.strong_id
        );
    }
}

#[test]
fn test_gc_spares_retained_images() {
    let fx = fixture();

    fx.provider.ordinator.create("c1", &spec()).unwrap();
    let top = &fx.state.manifest.layers[1];
    fx.provider
        .retainer
        .retain(&layercake_graph::LayerId::image(top.strong_id.clone()));
    fx.provider.ordinator.destroy("c1").unwrap();

    fx.provider.ordinator.gc().unwrap();
    // the retained top layer and its ancestor chain survive
    for layer in &fx.state.manifest.layers {
        assert!(layer_metadata_exists(&fx.root, &layer.strong_id));
    }
}

#[test]
fn test_namespaced_create_translates_a_copy_once() {
    let fx = fixture();

    let mut namespaced = spec();
    namespaced.namespaced = true;

    fx.provider.ordinator.create("c1", &namespaced).unwrap();
    fx.provider.ordinator.create("c2", &namespaced).unwrap();

    // one translated copy serves both containers
    let translated = fx.namespacer.translated.lock().unwrap();
    assert_eq!(translated.len(), 1);

    // the copy carries the parent layer's contents
    assert!(translated[0].join("etc/hosts").exists());

    // and the side table links it back to the image layer
    let top = &fx.state.manifest.layers[1];
    let children = fs::read_to_string(
        fx.root.join("garden-info/parent-child").join(&top.strong_id),
    )
    .unwrap();
    assert_eq!(children.lines().count(), 1);
}
