// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cache::AttestationCache;
use crate::config::GatewayConfig;
use crate::dcap::DcapVerifier;
use crate::orchestrator::{Orchestrator, Pipeline, Timeouts};
use crate::provenance::GithubProvenance;
use crate::quote_client::HttpQuoteFetcher;
use crate::store::{FileStore, RegistrationStore};

#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<GatewayStateInner>,
}

impl std::ops::Deref for GatewayState {
    type Target = GatewayStateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct GatewayStateInner {
    pub config: GatewayConfig,
    pub store: Arc<dyn RegistrationStore>,
    pub cache: AttestationCache,
    pub dcap_library_available: bool,
    /// Client used to relay traffic to applications.
    pub(crate) upstream: reqwest::Client,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn RegistrationStore>,
        pipeline: Arc<dyn Pipeline>,
        dcap_library_available: bool,
    ) -> Result<Self> {
        let upstream = reqwest::Client::builder()
            .timeout(config.proxy_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream client")?;
        let cache = AttestationCache::new(pipeline, config.cache_ttl());
        Ok(Self {
            inner: Arc::new(GatewayStateInner {
                config,
                store,
                cache,
                dcap_library_available,
                upstream,
            }),
        })
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let store: Arc<dyn RegistrationStore> = Arc::new(
            FileStore::load(
                config.registry_file.as_deref(),
                config.state_dir.as_deref(),
                config.history_limit,
            )
            .context("failed to load registrations")?,
        );
        let dcap = Arc::new(DcapVerifier::load(config.dcap_library_path.as_deref()));
        let dcap_library_available = dcap.is_library_available();
        let provenance = Arc::new(
            GithubProvenance::new(&config.github_api_base, config.github_token.clone())
                .context("failed to create provenance client")?,
        );
        let fetcher = Arc::new(HttpQuoteFetcher::new()?);
        let orchestrator = Orchestrator::new(store.clone(), fetcher, dcap, provenance)
            .with_timeouts(Timeouts::from_config(&config))
            .with_nonce_binding(config.bind_nonce);
        info!(
            dcap_library_available,
            cache_ttl_secs = config.cache_ttl_secs,
            bind_nonce = config.bind_nonce,
            "gateway state initialised"
        );
        Self::new(config, store, Arc::new(orchestrator), dcap_library_available)
    }
}
