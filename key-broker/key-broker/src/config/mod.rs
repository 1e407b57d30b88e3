// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

pub mod aps;
pub mod saml;

pub use aps::{ApsConfig, AuthConfig};
pub use saml::SamlConfig;

pub const DEFAULT_KBS_CONFIG_PATH: &str = "/etc/kbs/kbs.toml";

/// Root of the directory stores and of the directory key-manager backend.
pub const DEFAULT_STORE_PATH: &str = "/opt/kbs";

/// Clock skew tolerated when checking `exp`/`nbf` of an attestation token.
const DEFAULT_TOKEN_LEEWAY_SECS: u64 = 60;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Where policies and key metadata are kept
    #[serde(default)]
    pub store: StoreConfig,

    /// Which backend holds the raw key material
    #[serde(default)]
    pub key_manager: KeyManagerConfig,

    /// Attestation Provisioning Service
    #[serde(default)]
    pub aps: ApsConfig,

    /// Bearer token verification for the management endpoints. Absent means
    /// the management endpoints are not authenticated by the key broker.
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Trust stores for the SAML report path. Absent disables the path.
    #[serde(default)]
    pub saml: Option<SamlConfig>,

    /// Attestation token verification settings
    #[serde(default)]
    pub token: TokenConfig,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Memory,
    #[default]
    Directory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub store_type: BackendType,

    #[serde(default = "default_store_path")]
    pub directory_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct KeyManagerConfig {
    #[serde(rename = "type", default)]
    pub manager_type: BackendType,

    #[serde(default = "default_store_path")]
    pub directory_path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: BackendType::default(),
            directory_path: default_store_path(),
        }
    }
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            manager_type: BackendType::default(),
            directory_path: default_store_path(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TokenConfig {
    /// JWS algorithms accepted on attestation and bearer tokens.
    #[serde(default = "default_allowed_algorithms")]
    pub allowed_algorithms: Vec<String>,

    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

fn default_allowed_algorithms() -> Vec<String> {
    ["RS256", "RS384", "PS256", "PS384"]
        .iter()
        .map(|alg| alg.to_string())
        .collect()
}

fn default_leeway() -> u64 {
    DEFAULT_TOKEN_LEEWAY_SECS
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            allowed_algorithms: default_allowed_algorithms(),
            leeway_secs: DEFAULT_TOKEN_LEEWAY_SECS,
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        Ok(Self {
            store: StoreConfig::default(),
            key_manager: KeyManagerConfig::default(),
            aps: ApsConfig::default(),
            auth: None,
            saml: None,
            token: TokenConfig::default(),
        })
    }

    /// A configuration keeping everything in memory, used by tests and by
    /// throwaway deployments.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig {
                store_type: BackendType::Memory,
                ..Default::default()
            },
            key_manager: KeyManagerConfig {
                manager_type: BackendType::Memory,
                ..Default::default()
            },
            aps: ApsConfig::default(),
            auth: None,
            saml: None,
            token: TokenConfig::default(),
        }
    }
}

impl TryFrom<&str> for Config {
    type Error = config::ConfigError;
    fn try_from(config_path: &str) -> Result<Self, Self::Error> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .set_default("store.type", "directory")?
            .set_default("key_manager.type", "directory")?
            .build()?;

        let cfg = c.try_deserialize()?;
        Ok(cfg)
    }
}
