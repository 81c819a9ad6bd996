// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Blocking HTTP client construction for registry connections.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::Deserialize;

fn default_connect_timeout() -> u64 {
    30
}

/// Connection tuning for registry dialing.
///
/// `timeout` bounds a whole request; zero (the default) means no overall
/// read timeout, which blob downloads of arbitrary size require.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout: u64,
    pub timeout: u64,
    pub skip_verify: bool,
    pub retry_limit: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: default_connect_timeout(),
            timeout: 0,
            skip_verify: false,
            retry_limit: 3,
        }
    }
}

pub(crate) fn build_client(config: &ConnectionConfig) -> reqwest::Result<Client> {
    let connect_timeout = if config.connect_timeout != 0 {
        Some(Duration::from_secs(config.connect_timeout))
    } else {
        None
    };
    let timeout = if config.timeout != 0 {
        Some(Duration::from_secs(config.timeout))
    } else {
        None
    };

    let mut cb = Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .redirect(Policy::none());

    if config.skip_verify {
        cb = cb.danger_accept_invalid_certs(true);
    }

    cb.build()
}

pub(crate) fn is_success_status(status: StatusCode) -> bool {
    status >= StatusCode::OK && status < StatusCode::BAD_REQUEST
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    status == StatusCode::MOVED_PERMANENTLY
        || status == StatusCode::FOUND
        || status == StatusCode::TEMPORARY_REDIRECT
}
