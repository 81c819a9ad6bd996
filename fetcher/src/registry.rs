// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! v2 registry connections.
//!
//! A connection is obtained through the auth handshake: ping `/v2/`, and on
//! 401 parse the `www-authenticate` challenge, fetching a bearer token from
//! the named realm or falling back to basic credentials. The resulting
//! authorization header is cached and refreshed once on the next 401.

use std::collections::HashMap;
use std::io::Read;
use std::sync::RwLock;

use reqwest::blocking::Response;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use url::{ParseError, Url};

use layercake_utils::digest::LayerDigest;

use crate::connection::{build_client, is_redirect_status, is_success_status, ConnectionConfig};
use crate::manifest::{self, Manifest};

const REGISTRY_CLIENT_ID: &str = "layercake-registry-client";
const HEADER_AUTHORIZATION: &str = "Authorization";
const HEADER_WWW_AUTHENTICATE: &str = "www-authenticate";

/// Error codes for registry communication.
#[derive(Debug)]
pub enum RegistryError {
    Common(String),
    Url(String, ParseError),
    Transport(reqwest::Error),
    Auth(String),
    NotFound(String),
    Response { status: u16, body: String },
    Manifest(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Common(s) => write!(f, "registry error, {}", s),
            RegistryError::Url(s, e) => write!(f, "failed to parse URL {}, {}", s, e),
            RegistryError::Transport(e) => write!(f, "network error, {}", e),
            RegistryError::Auth(s) => write!(f, "registry auth failed, {}", s),
            RegistryError::NotFound(s) => write!(f, "{} not found", s),
            RegistryError::Response { status, body } => {
                write!(f, "registry responded {}: {}", status, body.trim_end())
            }
            RegistryError::Manifest(s) => write!(f, "invalid manifest, {}", s),
        }
    }
}

impl std::error::Error for RegistryError {}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// An authenticated connection to one repository on one registry host.
pub trait Conn: Send + Sync {
    fn get_manifest(&self, tag: &str) -> RegistryResult<Manifest>;

    /// Open the raw blob stream for `digest`.
    fn get_blob_reader(&self, digest: &LayerDigest) -> RegistryResult<Box<dyn Read + Send>>;
}

/// Performs the auth handshake and yields a connection.
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        host: &str,
        repo: &str,
        username: &str,
        password: &str,
    ) -> RegistryResult<Box<dyn Conn>>;
}

#[derive(Default)]
struct Cache(RwLock<String>);

impl Cache {
    fn get(&self) -> String {
        self.0.read().unwrap().clone()
    }

    fn set(&self, current: String) {
        let mut cached = self.0.write().unwrap();
        if *cached != current {
            *cached = current;
        }
    }
}

#[derive(Debug, PartialEq)]
struct BasicAuth {
    realm: String,
}

#[derive(Debug, PartialEq)]
struct BearerAuth {
    realm: String,
    service: String,
    scope: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Auth {
    Basic(BasicAuth),
    Bearer(BearerAuth),
}

/// Parse a `www-authenticate` response header.
///
/// The header looks like:
/// `Bearer realm="https://auth.my-registry.com/token",service="my-registry.com",scope="repository:test/repo:pull"`
fn parse_auth(source: &str) -> Option<Auth> {
    let source: Vec<&str> = source.splitn(2, ' ').collect();
    if source.len() < 2 {
        return None;
    }
    let scheme = source[0].trim();
    let pairs = source[1].trim().split("\",");
    let mut paras = HashMap::new();
    for pair in pairs {
        let pair: Vec<&str> = pair.trim().splitn(2, '=').collect();
        if pair.len() < 2 {
            return None;
        }
        let key = pair[0].trim();
        let value = pair[1].trim().trim_matches('"');
        paras.insert(key, value);
    }

    match scheme {
        "Basic" => {
            let realm = paras.get("realm").map(|r| (*r).to_string()).unwrap_or_default();
            Some(Auth::Basic(BasicAuth { realm }))
        }
        "Bearer" => {
            let realm = paras.get("realm")?;
            let service = paras.get("service")?;
            Some(Auth::Bearer(BearerAuth {
                realm: (*realm).to_string(),
                service: (*service).to_string(),
                scope: paras.get("scope").map(|s| (*s).to_string()),
            }))
        }
        _ => None,
    }
}

#[derive(Clone, serde::Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Production dialer over HTTP(S).
pub struct RegistryDialer {
    scheme: String,
    config: ConnectionConfig,
}

impl RegistryDialer {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_scheme("https", config)
    }

    pub fn with_scheme(scheme: &str, config: ConnectionConfig) -> Self {
        RegistryDialer {
            scheme: scheme.to_string(),
            config,
        }
    }
}

impl Dialer for RegistryDialer {
    fn dial(
        &self,
        host: &str,
        repo: &str,
        username: &str,
        password: &str,
    ) -> RegistryResult<Box<dyn Conn>> {
        let client = build_client(&self.config).map_err(RegistryError::Transport)?;

        let conn = RegistryConn {
            client,
            scheme: self.scheme.clone(),
            host: host.to_string(),
            repo: repo.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            cached_auth: Cache::default(),
        };
        conn.ping()?;

        Ok(Box::new(conn))
    }
}

pub struct RegistryConn {
    client: reqwest::blocking::Client,
    scheme: String,
    host: String,
    repo: String,
    username: String,
    password: String,
    // Cached authorization header, either `Bearer <token>` or
    // `Basic base64(<username:password>)`, to keep the pressure off the
    // token server.
    cached_auth: Cache,
}

impl RegistryConn {
    fn url(&self, path: &str) -> RegistryResult<String> {
        let url = format!("{}://{}", self.scheme, self.host);
        let url = Url::parse(&url).map_err(|e| RegistryError::Url(url.clone(), e))?;
        let url = url
            .join(&format!("/v2/{}{}", self.repo, path))
            .map_err(|e| RegistryError::Url(path.to_string(), e))?;
        Ok(url.to_string())
    }

    /// Reachability check; an auth challenge is still a reachable registry.
    fn ping(&self) -> RegistryResult<()> {
        let url = format!("{}://{}/v2/", self.scheme, self.host);
        let resp = self.call(Method::GET, &url, HeaderMap::new())?;
        let status = resp.status();
        if is_success_status(status) || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        Err(RegistryError::Response {
            status: status.as_u16(),
            body: resp.text().unwrap_or_default(),
        })
    }

    fn call(&self, method: Method, url: &str, headers: HeaderMap) -> RegistryResult<Response> {
        debug!("registry request: {} {}", method, url);
        self.client
            .request(method, url)
            .headers(headers)
            .send()
            .map_err(RegistryError::Transport)
    }

    /// Request the registry authentication server for a bearer token.
    fn get_token(&self, auth: BearerAuth) -> RegistryResult<String> {
        let scope = auth
            .scope
            .unwrap_or_else(|| format!("repository:{}:pull", self.repo));

        let mut query = HashMap::new();
        query.insert("service".to_string(), auth.service);
        query.insert("scope".to_string(), scope);
        query.insert("grant_type".to_string(), "password".to_string());
        query.insert("username".to_string(), self.username.clone());
        query.insert("password".to_string(), self.password.clone());
        query.insert("client_id".to_string(), REGISTRY_CLIENT_ID.to_string());

        let resp = self
            .client
            .post(&auth.realm)
            .form(&query)
            .send()
            .map_err(RegistryError::Transport)?;
        if !is_success_status(resp.status()) {
            return Err(RegistryError::Auth(format!(
                "token server responded {}",
                resp.status()
            )));
        }

        let ret: TokenResponse = resp
            .json()
            .map_err(|e| RegistryError::Auth(format!("token response decode failed: {}", e)))?;
        Ok(ret.token)
    }

    fn auth_header(&self, auth: Auth) -> RegistryResult<String> {
        match auth {
            Auth::Basic(_) => {
                if self.username.is_empty() {
                    return Err(RegistryError::Auth(
                        "registry requires basic auth but no credentials were given".to_string(),
                    ));
                }
                Ok(format!(
                    "Basic {}",
                    base64::encode(format!("{}:{}", self.username, self.password))
                ))
            }
            Auth::Bearer(auth) => {
                let token = self.get_token(auth)?;
                Ok(format!("Bearer {}", token))
            }
        }
    }

    /// Issue a request, answering at most one auth challenge.
    fn request(&self, method: Method, url: &str) -> RegistryResult<Response> {
        let mut headers = HeaderMap::new();
        let cached_auth = self.cached_auth.get();
        if !cached_auth.is_empty() {
            headers.insert(
                HEADER_AUTHORIZATION,
                HeaderValue::from_str(&cached_auth)
                    .map_err(|e| RegistryError::Common(e.to_string()))?,
            );
        }

        let resp = self.call(method.clone(), url, headers.clone())?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(HEADER_WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_auth)
            .ok_or_else(|| {
                RegistryError::Auth("unsupported or missing auth challenge".to_string())
            })?;

        let auth_header = self.auth_header(challenge)?;
        headers.insert(
            HEADER_AUTHORIZATION,
            HeaderValue::from_str(&auth_header)
                .map_err(|e| RegistryError::Common(e.to_string()))?,
        );

        let resp = self.call(method, url, headers)?;
        if is_success_status(resp.status()) {
            self.cached_auth.set(auth_header);
        }
        Ok(resp)
    }
}

impl Conn for RegistryConn {
    fn get_manifest(&self, tag: &str) -> RegistryResult<Manifest> {
        let url = self.url(&format!("/manifests/{}", tag))?;
        let resp = self.request(Method::GET, &url)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!(
                "manifest {}:{}",
                self.repo, tag
            )));
        }
        if !is_success_status(status) {
            return Err(RegistryError::Response {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        let body = resp.text().map_err(RegistryError::Transport)?;
        manifest::parse(&body)
    }

    /// Open the blob stream, following one redirect to a blob server.
    fn get_blob_reader(&self, digest: &LayerDigest) -> RegistryResult<Box<dyn Read + Send>> {
        let url = self.url(&format!("/blobs/{}", digest.to_registry_string()))?;
        let mut resp = self.request(Method::GET, &url)?;

        if is_redirect_status(resp.status()) {
            let location = resp
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    RegistryError::Common("redirect without a location header".to_string())
                })?;
            resp = self.call(Method::GET, &location, HeaderMap::new())?;
        }

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!("blob {}", digest)));
        }
        if !is_success_status(status) {
            return Err(RegistryError::Response {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        Ok(Box::new(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_auth() {
        let auth = parse_auth(
            "Bearer realm=\"https://auth.my-registry.com/token\",service=\"my-registry.com\",scope=\"repository:test/repo:pull,push\"",
        )
        .unwrap();
        assert_eq!(
            auth,
            Auth::Bearer(BearerAuth {
                realm: "https://auth.my-registry.com/token".to_string(),
                service: "my-registry.com".to_string(),
                scope: Some("repository:test/repo:pull,push".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_bearer_auth_without_scope() {
        // the /v2/ ping challenge carries no scope
        let auth = parse_auth(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        )
        .unwrap();
        match auth {
            Auth::Bearer(bearer) => {
                assert_eq!(bearer.realm, "https://auth.docker.io/token");
                assert!(bearer.scope.is_none());
            }
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_parse_basic_auth() {
        let auth = parse_auth("Basic realm=\"my-registry\"").unwrap();
        assert_eq!(
            auth,
            Auth::Basic(BasicAuth {
                realm: "my-registry".to_string()
            })
        );
    }

    #[test]
    fn test_parse_auth_rejects_unknown_schemes() {
        assert!(parse_auth("Digest realm=\"x\"").is_none());
        assert!(parse_auth("Bearer").is_none());
        assert!(parse_auth("Bearer realm=\"x\"").is_none());
    }

    #[test]
    fn test_url_building() {
        let conn = RegistryConn {
            client: build_client(&ConnectionConfig::default()).unwrap(),
            scheme: "https".to_string(),
            host: "registry-1.docker.io".to_string(),
            repo: "library/busybox".to_string(),
            username: String::new(),
            password: String::new(),
            cached_auth: Cache::default(),
        };

        assert_eq!(
            conn.url("/manifests/latest").unwrap(),
            "https://registry-1.docker.io/v2/library/busybox/manifests/latest"
        );
    }

    #[test]
    fn test_cache_keeps_the_latest_value() {
        let cache = Cache::default();
        assert_eq!(cache.get(), "");
        cache.set("Bearer abc".to_string());
        assert_eq!(cache.get(), "Bearer abc");
        cache.set("Bearer def".to_string());
        assert_eq!(cache.get(), "Bearer def");
    }
}
