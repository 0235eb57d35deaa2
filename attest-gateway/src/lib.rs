// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation-gated reverse proxy.
//!
//! Requests to `/proxy/<app_id>/...` are forwarded only after the application's TD
//! quote, build provenance and measurements have been verified.

use rocket::{figment::Figment, Build, Rocket};

pub use cache::{AttestationCache, CacheEntry, CacheStats};
pub use config::{load_config_figment, GatewayConfig};
pub use dcap::{DcapVerifier, QuoteVerifier};
pub use error::GateError;
pub use orchestrator::{Orchestrator, Pipeline, Timeouts};
pub use provenance::{GithubProvenance, ProvenanceCheck};
pub use quote_client::{HttpQuoteFetcher, QuoteFetcher};
pub use state::GatewayState;
pub use store::{FileStore, RegistrationStore};

pub mod admin;
mod cache;
pub mod config;
pub mod dcap;
mod error;
pub mod forwarder;
pub mod measurement;
mod orchestrator;
pub mod provenance;
mod quote_client;
mod state;
mod store;

pub fn build_rocket(figment: Figment, state: GatewayState) -> Rocket<Build> {
    rocket::custom(figment)
        .mount("/", forwarder::Forwarder::routes(state.clone()))
        .mount("/", rocket::routes![forwarder::app_status])
        .mount("/", admin::health_routes())
        .mount("/api/v1", admin::routes())
        .manage(state)
}
