// Copyright (c) 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kbs/kbs-api-server.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:9443";

#[derive(Debug, Deserialize, PartialEq)]
pub struct ApiServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Key broker configuration file. The built-in defaults are used when
    /// this is not set.
    #[serde(default)]
    pub key_broker_config: Option<String>,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

pub fn load_config(path: &str) -> Result<ApiServerConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path).required(false))
        .build()
        .context(format!("failed to load api server config: {}", path))?;

    let cfg: ApiServerConfig = settings
        .try_deserialize()
        .context("failed to deserialize api server config")?;

    Ok(cfg)
}
