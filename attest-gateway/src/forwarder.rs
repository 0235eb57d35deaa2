// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Verify-then-forward front door under `/proxy/<app_id>/...`.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use gate_types::{VerificationResult, VerificationStatus};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rocket::data::{Data, ToByteUnit};
use rocket::http::{Method, Status};
use rocket::response::{self, Responder};
use rocket::route::{Handler, Outcome, Route};
use rocket::serde::json::Json;
use rocket::{get, Request, Response, State};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::CacheStats;
use crate::state::GatewayState;
use crate::GateError;

const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const PROXIED_METHODS: &[Method] = &[
    Method::Get,
    Method::Put,
    Method::Post,
    Method::Delete,
    Method::Options,
    Method::Head,
    Method::Patch,
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// `/proxy/<app_id>/<rest>` into the application id and the raw remainder.
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/proxy/")?;
    let (app_id, tail) = rest.split_once('/').unwrap_or((rest, ""));
    (!app_id.is_empty()).then_some((app_id, tail))
}

pub fn upstream_url(endpoint: &str, rest: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/{rest}", endpoint.trim_end_matches('/'));
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Upstream header as a rocket header; rocket only carries UTF-8 values.
fn relayable(name: &HeaderName, value: &HeaderValue) -> Option<(String, String)> {
    match std::str::from_utf8(value.as_bytes()) {
        Ok(value) => Some((name.to_string(), value.to_string())),
        Err(_) => {
            debug!(header = %name, "dropping upstream header that is not valid UTF-8");
            None
        }
    }
}

/// 403 body for a request refused on attestation grounds.
fn denial(result: &VerificationResult) -> Value {
    json!({
        "error": result.first_failure().unwrap_or("attestation verification failed"),
        "status": result.status,
        "dcap_valid": result.dcap.verified,
        "github_valid": result.github.verified,
        "measurements_valid": result.measurements.verified,
        "dcap_status": result.dcap.status,
        "verified_at": result.verified_at,
    })
}

/// An upstream response relayed back to the client.
struct Relayed {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl<'r> Responder<'r, 'static> for Relayed {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let mut response = Response::build();
        response.status(Status::new(self.status));
        for (name, value) in self.headers {
            response.raw_header_adjoin(name, value);
        }
        response.sized_body(self.body.len(), Cursor::new(self.body));
        Ok(response.finalize())
    }
}

type Refusal = (Status, Json<Value>);

fn refuse(status: Status, error: impl std::fmt::Display) -> Refusal {
    (status, Json(json!({ "error": error.to_string() })))
}

#[derive(Clone)]
pub struct Forwarder {
    state: GatewayState,
}

impl Forwarder {
    pub fn routes(state: GatewayState) -> Vec<Route> {
        let forwarder = Self { state };
        PROXIED_METHODS
            .iter()
            .flat_map(|method| {
                [
                    Route::ranked(10, *method, "/proxy/<app_id>/<path..>", forwarder.clone()),
                    Route::ranked(11, *method, "/proxy/<app_id>", forwarder.clone()),
                ]
            })
            .collect()
    }

    async fn forward<'r>(&self, req: &'r Request<'_>, data: Data<'r>) -> Result<Relayed, Refusal> {
        let path = req.uri().path();
        let (app_id, rest) = split_proxy_path(path.as_str())
            .ok_or_else(|| refuse(Status::NotFound, "missing application id"))?;
        let registration = self
            .state
            .store
            .registration(app_id)
            .await
            .ok_or_else(|| {
                refuse(
                    Status::NotFound,
                    GateError::UnknownRegistration(app_id.to_string()),
                )
            })?;

        let entry = self.state.cache.get_or_verify(&registration.id).await;
        let verdict = &entry.result;
        if !verdict.is_success() {
            warn!(
                app = %registration.id,
                status = %verdict.status,
                "request refused: {}",
                verdict.first_failure().unwrap_or("verification failed")
            );
            return Err((Status::Forbidden, Json(denial(verdict))));
        }

        let limit = self.state.config.max_body_bytes.bytes();
        let body = match data.open(limit).into_bytes().await {
            Ok(body) if body.is_complete() => body.into_inner(),
            Ok(_) => return Err(refuse(Status::PayloadTooLarge, "request body too large")),
            Err(err) => return Err(refuse(Status::BadRequest, format!("failed to read body: {err}"))),
        };

        let url = upstream_url(
            &registration.app_endpoint,
            rest,
            req.uri().query().map(|q| q.as_str()),
        );
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|_| refuse(Status::MethodNotAllowed, "unsupported method"))?;
        let mut headers = HeaderMap::new();
        for header in req.headers().iter() {
            let name = header.name().as_str();
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(header.value()),
            ) {
                headers.append(name, value);
            }
        }

        debug!(app = %registration.id, %method, %url, "forwarding request");
        let upstream_error = |err: reqwest::Error| {
            warn!(app = %registration.id, %url, "upstream error: {err}");
            (
                Status::BadGateway,
                Json(json!({
                    "error": "Proxy error",
                    "message": GateError::UpstreamUnreachable(err.to_string()).to_string(),
                    "target": url,
                })),
            )
        };
        let response = self
            .state
            .upstream
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(upstream_error)?;

        let status = response.status().as_u16();
        let mut relayed_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length")
            .filter_map(|(name, value)| relayable(name, value))
            .collect();
        let body = response.bytes().await.map_err(upstream_error)?.to_vec();

        relayed_headers.extend([
            ("X-TDX-Verified".to_string(), "true".to_string()),
            (
                "X-TDX-Verification-Time".to_string(),
                verdict.verified_at.to_rfc3339(),
            ),
            ("X-TDX-DCAP-Status".to_string(), verdict.dcap.status.clone()),
            ("X-TDX-Cache-Expires".to_string(), entry.expires_at.to_rfc3339()),
        ]);
        info!(app = %registration.id, status, bytes = body.len(), "request forwarded");
        Ok(Relayed {
            status,
            headers: relayed_headers,
            body,
        })
    }
}

#[rocket::async_trait]
impl Handler for Forwarder {
    async fn handle<'r>(&self, req: &'r Request<'_>, data: Data<'r>) -> Outcome<'r> {
        let reply = self.forward(req, data).await;
        Outcome::from(req, reply)
    }
}

#[derive(Debug, Serialize)]
pub struct AppStatus {
    pub app_id: String,
    pub app_name: String,
    pub app_endpoint: String,
    pub tdx_proxy_endpoint: String,
    pub attestation_cached: bool,
    pub status: VerificationStatus,
    pub verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dcap_status: Option<String>,
    pub dcap_mock: bool,
    pub dcap_valid: bool,
    pub github_valid: bool,
    pub measurements_valid: bool,
    pub cache: CacheStats,
}

/// Cached verdict only; never verifies or forwards.
#[get("/proxy/<app_id>/_status")]
pub async fn app_status(
    state: &State<GatewayState>,
    app_id: &str,
) -> Result<Json<AppStatus>, GateError> {
    let registration = state
        .store
        .registration(app_id)
        .await
        .ok_or_else(|| GateError::UnknownRegistration(app_id.to_string()))?;
    let entry = state.cache.get(&registration.id);
    let result = entry.as_ref().map(|e| &e.result);
    Ok(Json(AppStatus {
        attestation_cached: entry.is_some(),
        status: result.map_or(VerificationStatus::Pending, |r| r.status),
        verified_at: result.map(|r| r.verified_at),
        expires_at: entry.as_ref().map(|e| e.expires_at),
        dcap_status: result.map(|r| r.dcap.status.clone()),
        dcap_mock: result.is_some_and(|r| r.dcap.mock),
        dcap_valid: result.is_some_and(|r| r.dcap.verified),
        github_valid: result.is_some_and(|r| r.github.verified),
        measurements_valid: result.is_some_and(|r| r.measurements.verified),
        cache: state.cache.stats(),
        app_id: registration.id,
        app_name: registration.name,
        app_endpoint: registration.app_endpoint,
        tdx_proxy_endpoint: registration.tdx_proxy_endpoint,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_proxy_paths() {
        assert_eq!(
            split_proxy_path("/proxy/app/api/v1/items"),
            Some(("app", "api/v1/items"))
        );
        assert_eq!(split_proxy_path("/proxy/app"), Some(("app", "")));
        assert_eq!(split_proxy_path("/proxy/app/"), Some(("app", "")));
        assert_eq!(split_proxy_path("/proxy/"), None);
        assert_eq!(split_proxy_path("/other/app"), None);
    }

    #[test]
    fn builds_upstream_urls() {
        assert_eq!(
            upstream_url("http://10.0.0.5:8080", "api/items", Some("page=2&q=a%20b")),
            "http://10.0.0.5:8080/api/items?page=2&q=a%20b"
        );
        assert_eq!(
            upstream_url("http://10.0.0.5:8080/base/", "", None),
            "http://10.0.0.5:8080/base/"
        );
    }

    #[test]
    fn relays_utf8_header_values() {
        let name = HeaderName::from_static("x-label");
        let accented = HeaderValue::from_bytes("café".as_bytes()).unwrap();
        assert_eq!(
            relayable(&name, &accented),
            Some(("x-label".to_string(), "café".to_string()))
        );
        let opaque = HeaderValue::from_bytes(&[b'a', 0xff]).unwrap();
        assert_eq!(relayable(&name, &opaque), None);
    }

    #[test]
    fn hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
