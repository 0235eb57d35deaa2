// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failure classes of the gateway.
///
/// Verification-path variants end up as text in a sub-result; only the forwarding and
/// admin variants ever become an HTTP error status.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("quote unavailable: {0}")]
    QuoteUnavailable(String),
    #[error("DCAP library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("provenance lookup failed: {0}")]
    ProvenanceLookupFailed(String),
    #[error("no baseline captured")]
    NoBaseline,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("application {0} not found")]
    UnknownRegistration(String),
    #[error("baseline already captured for {0}; pass force to replace it")]
    BaselineAlreadyCaptured(String),
    #[error("evidence rejected: {0}")]
    EvidenceRejected(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GateError {
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownRegistration(_) => Status::NotFound,
            Self::BaselineAlreadyCaptured(_) => Status::Conflict,
            Self::UpstreamUnreachable(_) | Self::QuoteUnavailable(_) => Status::BadGateway,
            Self::NoBaseline | Self::EvidenceRejected(_) => Status::UnprocessableEntity,
            Self::ProvenanceLookupFailed(_) | Self::LibraryUnavailable(_) | Self::Other(_) => {
                Status::InternalServerError
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl<'r> Responder<'r, 'static> for GateError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!(uri = %req.uri(), "{self:#}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .respond_to(req)
    }
}
