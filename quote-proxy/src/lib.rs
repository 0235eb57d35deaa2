// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Quote source sidecar running inside the trust domain.

use std::sync::Arc;

use rocket::{figment::Figment, Build, Rocket};

pub use config::{load_config_figment, Config};
pub use log_ring::LogRing;
pub use source::{Backend, QuoteError, QuoteSource};

pub mod config;
mod log_ring;
pub mod routes;
mod source;

pub fn build_rocket(figment: Figment, source: Arc<QuoteSource>) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(source)
        .mount("/", routes::routes())
}
