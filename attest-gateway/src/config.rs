// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rocket::figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Lifetime of a cached verdict.
    pub cache_ttl_secs: u64,
    /// Intel QVL (`libsgx_dcap_quoteverify`). Unset or unloadable means mock mode.
    pub dcap_library_path: Option<String>,
    pub github_api_base: String,
    pub github_token: Option<String>,
    pub quote_timeout_secs: u64,
    pub dcap_timeout_secs: u64,
    pub provenance_timeout_secs: u64,
    pub proxy_timeout_secs: u64,
    /// Largest request body relayed to an application.
    pub max_body_bytes: u64,
    /// JSON array of registrations.
    pub registry_file: Option<PathBuf>,
    /// Where captured baselines and history survive restarts.
    pub state_dir: Option<PathBuf>,
    pub history_limit: usize,
    /// Bind each fetched quote to a fresh nonce.
    pub bind_nonce: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            dcap_library_path: None,
            github_api_base: DEFAULT_GITHUB_API.into(),
            github_token: None,
            quote_timeout_secs: 60,
            dcap_timeout_secs: 30,
            provenance_timeout_secs: 30,
            proxy_timeout_secs: 30,
            max_body_bytes: 16 << 20,
            registry_file: None,
            state_dir: None,
            history_limit: 1000,
            bind_nonce: true,
        }
    }
}

impl GatewayConfig {
    pub fn extract(figment: &Figment) -> Result<Self> {
        figment
            .focus("core")
            .extract()
            .context("failed to load gateway configuration")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_secs(self.quote_timeout_secs)
    }

    pub fn dcap_timeout(&self) -> Duration {
        Duration::from_secs(self.dcap_timeout_secs)
    }

    pub fn provenance_timeout(&self) -> Duration {
        Duration::from_secs(self.provenance_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

/// Defaults, then the optional TOML file, then `GATE_*` variables onto `[core]`.
pub fn load_config_figment(config_file: Option<&str>) -> Figment {
    let mut figment =
        rocket::Config::figment().join(Serialized::default("core", GatewayConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("GATE_").map(|key| format!("core.{key}").into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::extract(&load_config_figment(None)).unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.github_api_base, "https://api.github.com");
        assert!(config.dcap_library_path.is_none());
        assert!(config.bind_nonce);
    }

    #[test]
    fn core_table_overrides() {
        let figment = load_config_figment(None).merge(Toml::string(
            r#"
            [core]
            cache_ttl_secs = 5
            dcap_library_path = "/usr/lib/libsgx_dcap_quoteverify.so.1"
            bind_nonce = false
            "#,
        ));
        let config = GatewayConfig::extract(&figment).unwrap();
        assert_eq!(config.cache_ttl_secs, 5);
        assert_eq!(
            config.dcap_library_path.as_deref(),
            Some("/usr/lib/libsgx_dcap_quoteverify.so.1")
        );
        assert!(!config.bind_nonce);
        assert_eq!(config.history_limit, 1000);
    }
}
