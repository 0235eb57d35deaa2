// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use rocket::figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared object name or path of Intel's `libtdx_attest`.
    pub tdx_attest_library: String,
    /// TSM report base directory.
    pub configfs_path: PathBuf,
    /// Lines kept for `GET /logs`.
    pub log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tdx_attest_library: tdx_attest::DEFAULT_LIBRARY.into(),
            configfs_path: tdx_attest::DEFAULT_CONFIGFS_BASE.into(),
            log_capacity: 500,
        }
    }
}

/// Defaults, then the optional TOML file, then `QUOTE_PROXY_*` variables.
///
/// Rocket keys (`address`, `port`, ...) are read from the top level, ours from `[core]`.
pub fn load_config_figment(config_file: Option<&str>) -> Figment {
    let mut figment =
        rocket::Config::figment().join(Serialized::default("core", Config::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("QUOTE_PROXY_").map(|key| format!("core.{key}").into()))
}

impl Config {
    pub fn extract(figment: &Figment) -> Result<Self> {
        figment
            .focus("core")
            .extract()
            .context("failed to load quote proxy configuration")
    }
}
