// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tdx_quote_proxy::{build_rocket, load_config_figment, Config, LogRing, QuoteSource};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "TDX quote source sidecar")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "QUOTE_PROXY_CONFIG")]
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
    let config = Config::extract(&figment)?;

    let log = Arc::new(LogRing::new(config.log_capacity));
    let source = Arc::new(QuoteSource::from_config(&config, log));
    let status = source.status();
    info!(available = status.available, method = %status.method, "quote source ready");

    build_rocket(figment, source)
        .launch()
        .await
        .context("quote proxy server failed")?;
    Ok(())
}
