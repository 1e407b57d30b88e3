// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::Deserialize;

pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_NONCE_TTL_SECS: u64 = 300;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApsConfig {
    /// URL Address of the Attestation Provisioning Service.
    pub url: String,

    /// PEM root certificate for the APS TLS endpoint.
    pub cert: Option<String>,

    /// How long a fetched token-signing certificate is trusted before it is
    /// fetched again.
    #[serde(default = "default_cache_ttl")]
    pub signing_cert_cache_ttl_secs: u64,

    /// Lifetime of a nonce handed out to a key-transfer caller.
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_nonce_ttl() -> u64 {
    DEFAULT_NONCE_TTL_SECS
}

impl Default for ApsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            cert: None,
            signing_cert_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            nonce_ttl_secs: DEFAULT_NONCE_TTL_SECS,
        }
    }
}

/// The authentication service issuing bearer tokens for the management
/// endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthConfig {
    pub url: String,

    pub cert: Option<String>,

    #[serde(default = "default_cache_ttl")]
    pub signing_cert_cache_ttl_secs: u64,
}
