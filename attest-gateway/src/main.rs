// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use attest_gateway::{build_rocket, load_config_figment, GatewayConfig, GatewayState};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Attestation-gated reverse proxy")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GATE_CONFIG")]
    config: Option<String>,
}

#[rocket::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    let args = Args::parse();
    let figment = load_config_figment(args.config.as_deref());
    let config = GatewayConfig::extract(&figment)?;

    let state = GatewayState::from_config(config)?;
    if !state.dcap_library_available {
        warn!("DCAP library not available, quotes are checked for structure only");
    }
    info!("attestation gateway starting");

    build_rocket(figment, state)
        .launch()
        .await
        .context("gateway server failed")?;
    Ok(())
}
