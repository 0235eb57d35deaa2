// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_human_bytes::base64;

use crate::Measurements;

/// Size of the caller-supplied report data bound into a TD quote.
pub const REPORT_DATA_SIZE: usize = 64;

/// How a quote was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteMethod {
    /// Native `libtdx_attest` through FFI.
    Native,
    /// Linux TSM configfs report interface.
    Configfs,
    /// Supplied by the caller of the gateway, not fetched from the proxy.
    Override,
}

impl QuoteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Configfs => "configfs",
            Self::Override => "override",
        }
    }
}

impl std::fmt::Display for QuoteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GET /status` of the quote proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteStatus {
    pub available: bool,
    /// `native`, `configfs` or `none`.
    pub method: String,
}

/// `POST /quote` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Base64, at most 64 bytes once decoded.
    #[serde(rename = "reportData", default, skip_serializing_if = "Option::is_none")]
    pub report_data: Option<String>,
}

/// Quote plus the measurements the proxy parsed out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    #[serde(with = "base64")]
    pub quote: Vec<u8>,
    pub quote_size: usize,
    pub measurements: Measurements,
    #[serde(with = "base64")]
    pub report_data: Vec<u8>,
    pub method: QuoteMethod,
}
