// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gate_types::{QuoteRequest, QuoteResponse, REPORT_DATA_SIZE};
use serde::Deserialize;

use crate::GateError;

/// Client side of the quote source protocol.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    /// `report_data` of `None` asks for a quote over all-zero report data.
    async fn fetch(
        &self,
        endpoint: &str,
        report_data: Option<&[u8; REPORT_DATA_SIZE]>,
    ) -> Result<QuoteResponse, GateError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct HttpQuoteFetcher {
    client: reqwest::Client,
}

impl HttpQuoteFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("attest-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QuoteFetcher for HttpQuoteFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        report_data: Option<&[u8; REPORT_DATA_SIZE]>,
    ) -> Result<QuoteResponse, GateError> {
        let url = format!("{}/quote", endpoint.trim_end_matches('/'));
        let request = match report_data {
            Some(data) => self.client.post(&url).json(&QuoteRequest {
                report_data: Some(STANDARD.encode(data)),
            }),
            None => self.client.get(&url),
        };
        let response = request
            .send()
            .await
            .map_err(|e| GateError::QuoteUnavailable(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let reason = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| "no detail".into());
            return Err(GateError::QuoteUnavailable(format!(
                "quote source returned HTTP {}: {reason}",
                status.as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| GateError::QuoteUnavailable(format!("malformed quote response: {e}")))
    }
}
