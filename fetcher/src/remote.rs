// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The remote fetcher: URL resolution, manifest retrieval and bottom-up
//! layer registration.
//!
//! Layers are fetched parents-first under a per-digest lock, so a layer is
//! registered only after its parent is in the graph and concurrent pulls of
//! one blob hit the network once. The per-image disk budget is checked
//! against the manifest before any blob transfer and decremented layer by
//! layer.

use std::io::Read;
use std::sync::Arc;

use url::Url;

use layercake_graph::{Cake, Image, LayerId};
use layercake_utils::QuotaedReader;

use crate::lock::FetchLock;
use crate::manifest::ManifestLayer;
use crate::registry::{Conn, Dialer, RegistryError};
use crate::verify::Verifier;
use crate::{FetchError, FetchResult, FetchedImage, RepositoryFetcher};

/// The Docker Hub keeps manifests of official images under `library/`.
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";

pub struct RemoteFetcher {
    default_host: String,
    dialer: Box<dyn Dialer>,
    cake: Arc<dyn Cake>,
    verifier: Verifier,
    fetch_lock: FetchLock,
}

impl RemoteFetcher {
    pub fn new(
        default_host: &str,
        dialer: Box<dyn Dialer>,
        cake: Arc<dyn Cake>,
        verifier: Verifier,
    ) -> Self {
        RemoteFetcher {
            default_host: default_host.to_string(),
            dialer,
            cake,
            verifier,
            fetch_lock: FetchLock::new(),
        }
    }

    /// Split a `docker://[host]/path[#tag]` URL into host, repo and tag.
    fn resolve(&self, url: &Url) -> (String, String, String) {
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => self.default_host.clone(),
        };

        let mut repo = url.path().trim_start_matches('/').to_string();
        if host == DOCKER_HUB_HOST && !repo.contains('/') {
            repo = format!("library/{}", repo);
        }

        let tag = match url.fragment() {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => DEFAULT_TAG.to_string(),
        };

        (host, repo, tag)
    }

    fn manifest(
        &self,
        url: &Url,
        username: &str,
        password: &str,
    ) -> FetchResult<(Box<dyn Conn>, crate::manifest::Manifest, String, String)> {
        let (host, repo, tag) = self.resolve(url);
        let registry_err = |cause: RegistryError| FetchError::Registry {
            host: host.clone(),
            repo: repo.clone(),
            cause,
        };

        let conn = self
            .dialer
            .dial(&host, &repo, username, password)
            .map_err(registry_err)?;
        let manifest = conn.get_manifest(&tag).map_err(registry_err)?;

        Ok((conn, manifest, host, repo))
    }

    fn fetch_layer(
        &self,
        conn: &dyn Conn,
        layer: &ManifestLayer,
        quota: i64,
        host: &str,
        repo: &str,
    ) -> FetchResult<i64> {
        let _guard = self.fetch_lock.acquire(&layer.blob_sum.hex());

        if let Ok(image) = self.cake.get(&LayerId::image(layer.strong_id.clone())) {
            debug!("layer {} already in the graph", layer.strong_id);
            return Ok(image.size);
        }

        let blob = conn.get_blob_reader(&layer.blob_sum).map_err(|cause| {
            FetchError::Registry {
                host: host.to_string(),
                repo: repo.to_string(),
                cause,
            }
        })?;

        let mut capped: Box<dyn Read> = if quota >= 0 {
            Box::new(QuotaedReader::new(blob, quota))
        } else {
            blob
        };

        let mut verified = self.verifier.verify(capped.as_mut(), &layer.blob_sum)?;
        let size = verified.size();

        let image = Image::new(layer.strong_id.clone())
            .with_parent(layer.parent_strong_id.clone())
            .with_size(size);
        self.cake
            .register_with_quota(image, &mut verified, quota)?;

        Ok(size)
    }
}

impl RepositoryFetcher for RemoteFetcher {
    fn fetch(
        &self,
        url: &Url,
        username: &str,
        password: &str,
        disk_quota: i64,
    ) -> FetchResult<FetchedImage> {
        info!("fetching {}", url);

        let (conn, manifest, host, repo) = self.manifest(url, username, password)?;

        let total_size = manifest.total_size();
        if disk_quota > 0 && total_size > disk_quota {
            return Err(FetchError::QuotaExceeded);
        }

        let mut remaining_quota = if disk_quota <= 0 { -1 } else { disk_quota };
        let mut env = Vec::new();
        let mut volumes = Vec::new();

        for layer in &manifest.layers {
            env.extend(layer.env.iter().cloned());
            volumes.extend(layer.volumes.iter().cloned());

            let size = self.fetch_layer(conn.as_ref(), layer, remaining_quota, &host, &repo)?;
            remaining_quota -= size;
        }

        info!("fetched {} ({} bytes)", url, total_size);
        Ok(FetchedImage {
            image_id: manifest.top_strong_id().to_string(),
            env,
            volumes,
            size: total_size,
        })
    }

    fn fetch_id(&self, url: &Url) -> FetchResult<LayerId> {
        let (_, manifest, _, _) = self.manifest(url, "", "")?;
        Ok(LayerId::image(manifest.top_strong_id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{registry_with_layers, FakeCake, FakeDialer, FakeRegistry, LayerSpec};
    use layercake_utils::digest::chain_id;
    use layercake_utils::digest::LayerDigest;
    use std::thread;

    fn fetcher_for(state: Arc<FakeRegistry>, cake: Arc<FakeCake>) -> RemoteFetcher {
        RemoteFetcher::new(
            DOCKER_HUB_HOST,
            Box::new(FakeDialer { state }),
            cake,
            Verifier::new(),
        )
    }

    fn two_layer_registry() -> Arc<FakeRegistry> {
        registry_with_layers(vec![
            LayerSpec::new(b"bottom layer bytes", 10)
                .with_env(&["PATH=/bin"])
                .with_volumes(&["/data"]),
            LayerSpec::new(b"top layer bytes", 2)
                .with_env(&["HOME=/root"])
                .with_volumes(&["/logs"]),
        ])
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_dials_the_host_from_the_url() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        fetcher
            .fetch(&url("docker://some.registry/foo/bar#v1"), "user", "pass", 0)
            .unwrap();

        let dials = state.dials.lock().unwrap();
        assert_eq!(
            dials[0],
            (
                "some.registry".to_string(),
                "foo/bar".to_string(),
                "user".to_string(),
                "pass".to_string()
            )
        );
        assert_eq!(state.manifest_tags.lock().unwrap()[0], "v1");
    }

    #[test]
    fn test_empty_host_uses_the_default_and_official_images_get_library() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        fetcher
            .fetch(&url("docker:///busybox#1.24.0"), "", "", 0)
            .unwrap();

        let dials = state.dials.lock().unwrap();
        assert_eq!(dials[0].0, DOCKER_HUB_HOST);
        assert_eq!(dials[0].1, "library/busybox");
        assert_eq!(state.manifest_tags.lock().unwrap()[0], "1.24.0");
    }

    #[test]
    fn test_paths_with_a_slash_are_not_rewritten() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        fetcher
            .fetch(&url("docker:///cloudfoundry/garden#latest"), "", "", 0)
            .unwrap();

        assert_eq!(state.dials.lock().unwrap()[0].1, "cloudfoundry/garden");
    }

    #[test]
    fn test_library_rule_only_applies_to_the_docker_hub() {
        let state = two_layer_registry();
        let fetcher = RemoteFetcher::new(
            "my.private.registry",
            Box::new(FakeDialer {
                state: state.clone(),
            }),
            Arc::new(FakeCake::default()),
            Verifier::new(),
        );

        fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();

        let dials = state.dials.lock().unwrap();
        assert_eq!(dials[0].0, "my.private.registry");
        assert_eq!(dials[0].1, "busybox");
    }

    #[test]
    fn test_missing_fragment_defaults_to_latest() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();
        assert_eq!(state.manifest_tags.lock().unwrap()[0], "latest");
    }

    #[test]
    fn test_registers_layers_parents_first() {
        let state = two_layer_registry();
        let cake = Arc::new(FakeCake::default());
        let fetcher = fetcher_for(state.clone(), cake.clone());

        fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();

        let expected: Vec<String> = state
            .manifest
            .layers
            .iter()
            .map(|l| l.strong_id.clone())
            .collect();
        // FakeCake::register_with_quota fails when the parent is missing,
        // so completing in this order proves parents came first
        assert_eq!(cake.registration_order(), expected);

        let registered = cake.get(&LayerId::image(expected[1].clone())).unwrap();
        assert_eq!(registered.parent, expected[0]);
    }

    #[test]
    fn test_skips_layers_already_in_the_graph() {
        let state = two_layer_registry();
        let cake = Arc::new(FakeCake::default());

        let bottom = &state.manifest.layers[0];
        cake.insert(
            Image::new(bottom.strong_id.clone()).with_size(123),
        );

        let fetcher = fetcher_for(state.clone(), cake.clone());
        fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();

        assert_eq!(state.reads_of(&bottom.blob_sum), 0);
        assert_eq!(state.reads_of(&state.manifest.layers[1].blob_sum), 1);
        assert_eq!(cake.registration_order().len(), 1);
    }

    #[test]
    fn test_manifest_over_quota_fails_before_any_blob_transfer() {
        let state = registry_with_layers(vec![
            LayerSpec::new(b"bottom", 60 * 1024 * 1024),
            LayerSpec::new(b"top", 40 * 1024 * 1024),
        ]);
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        let err = fetcher
            .fetch(&url("docker:///busybox"), "", "", 10 * 1024 * 1024)
            .unwrap_err();
        assert!(matches!(err, FetchError::QuotaExceeded));
        assert_eq!(state.total_blob_reads(), 0);
    }

    #[test]
    fn test_total_size_equal_to_quota_is_allowed() {
        let state = registry_with_layers(vec![LayerSpec::new(b"only", 100)]);
        let fetcher = fetcher_for(state, Arc::new(FakeCake::default()));

        fetcher.fetch(&url("docker:///busybox"), "", "", 100).unwrap();
    }

    #[test]
    fn test_digest_mismatch_aborts_without_registration() {
        let state = two_layer_registry();
        let cake = Arc::new(FakeCake::default());

        state.corrupt_blob(&state.manifest.layers[0].blob_sum);

        let fetcher = fetcher_for(state.clone(), cake.clone());
        let err = fetcher
            .fetch(&url("docker:///busybox"), "", "", 0)
            .unwrap_err();

        assert!(matches!(err, FetchError::DigestMismatch { .. }));
        assert!(cake.registration_order().is_empty());
    }

    #[test]
    fn test_combines_env_and_volumes_across_layers() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state, Arc::new(FakeCake::default()));

        let image = fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();
        assert_eq!(
            image.env,
            vec!["PATH=/bin".to_string(), "HOME=/root".to_string()]
        );
        assert_eq!(image.volumes, vec!["/data".to_string(), "/logs".to_string()]);
    }

    #[test]
    fn test_returns_the_top_layer_id_and_the_total_size() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        let image = fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap();

        let bottom = LayerDigest::from_buf(b"bottom layer bytes").hex();
        let top = LayerDigest::from_buf(b"top layer bytes").hex();
        let expected_top = chain_id(&chain_id("", &bottom), &top);
        assert_eq!(image.image_id, expected_top);
        assert_eq!(image.size, 12);
    }

    #[test]
    fn test_fetch_id_resolves_without_pulling_blobs() {
        let state = two_layer_registry();
        let fetcher = fetcher_for(state.clone(), Arc::new(FakeCake::default()));

        let id = fetcher.fetch_id(&url("docker:///busybox#1.24.0")).unwrap();
        assert_eq!(
            id,
            LayerId::image(state.manifest.layers[1].strong_id.clone())
        );
        assert_eq!(state.total_blob_reads(), 0);
    }

    #[test]
    fn test_dial_failures_carry_host_and_repo_context() {
        let state = two_layer_registry();
        *state.fail_dial.lock().unwrap() = Some("connection refused".to_string());
        let fetcher = fetcher_for(state, Arc::new(FakeCake::default()));

        let err = fetcher
            .fetch(&url("docker:///busybox"), "", "", 0)
            .unwrap_err();
        match err {
            FetchError::Registry { host, repo, .. } => {
                assert_eq!(host, DOCKER_HUB_HOST);
                assert_eq!(repo, "library/busybox");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_concurrent_identical_fetches_download_each_blob_once() {
        let state = two_layer_registry();
        let cake = Arc::new(FakeCake::default());
        let fetcher = Arc::new(fetcher_for(state.clone(), cake.clone()));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let fetcher = fetcher.clone();
            handles.push(thread::spawn(move || {
                fetcher.fetch(&url("docker:///busybox"), "", "", 0).unwrap()
            }));
        }

        let results: Vec<FetchedImage> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);

        for layer in &state.manifest.layers {
            assert_eq!(state.reads_of(&layer.blob_sum), 1);
        }
    }
}
