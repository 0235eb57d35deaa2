// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use gate_types::{Measurements, Registration, VerificationResult};
use rocket::serde::json::Json;
use rocket::{delete, get, post, routes, Route, State};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStats;
use crate::state::GatewayState;
use crate::GateError;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub registration_id: String,
    #[serde(default)]
    pub quote_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BaselineRequest {
    pub registration_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct BaselineResponse {
    pub registration_id: String,
    pub measurements: Measurements,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub registration_id: String,
    pub invalidated: bool,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub dcap_library_available: bool,
    pub cache: CacheStats,
}

async fn ensure_known(state: &GatewayState, id: &str) -> Result<Registration, GateError> {
    state
        .store
        .registration(id)
        .await
        .ok_or_else(|| GateError::UnknownRegistration(id.to_string()))
}

#[post("/verify", data = "<request>")]
async fn verify(
    state: &State<GatewayState>,
    request: Json<VerifyRequest>,
) -> Result<Json<VerificationResult>, GateError> {
    let request = request.into_inner();
    let registration = ensure_known(state, &request.registration_id).await?;
    info!(
        registration = %registration.id,
        with_override = request.quote_base64.is_some(),
        "verification requested"
    );
    let result = state
        .cache
        .verify_now(&registration.id, request.quote_base64)
        .await;
    Ok(Json(result))
}

#[get("/verify/history?<registration_id>&<skip>&<limit>")]
async fn history(
    state: &State<GatewayState>,
    registration_id: Option<&str>,
    skip: Option<usize>,
    limit: Option<usize>,
) -> Json<Vec<VerificationResult>> {
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Json(
        state
            .store
            .history(registration_id, skip.unwrap_or(0), limit)
            .await,
    )
}

#[post("/verify/baseline", data = "<request>")]
async fn capture_baseline(
    state: &State<GatewayState>,
    request: Json<BaselineRequest>,
) -> Result<Json<BaselineResponse>, GateError> {
    let request = request.into_inner();
    let registration = ensure_known(state, &request.registration_id).await?;
    let (baseline, captured_at) = state
        .cache
        .capture_baseline(&registration.id, request.force)
        .await?;
    Ok(Json(BaselineResponse {
        registration_id: registration.id,
        measurements: Measurements {
            mrtd: baseline.mrtd,
            rtmr0: baseline.rtmr0,
            rtmr1: baseline.rtmr1,
            rtmr2: baseline.rtmr2,
            rtmr3: baseline.rtmr3,
        },
        captured_at,
    }))
}

#[delete("/cache/<registration_id>")]
async fn invalidate(
    state: &State<GatewayState>,
    registration_id: &str,
) -> Result<Json<InvalidateResponse>, GateError> {
    let registration = ensure_known(state, registration_id).await?;
    let invalidated = state.cache.invalidate(&registration.id);
    info!(registration = %registration.id, invalidated, "cache invalidated");
    Ok(Json(InvalidateResponse {
        registration_id: registration.id,
        invalidated,
    }))
}

#[get("/registrations/<registration_id>")]
async fn registration(
    state: &State<GatewayState>,
    registration_id: &str,
) -> Result<Json<Registration>, GateError> {
    ensure_known(state, registration_id).await.map(Json)
}

#[get("/health")]
fn health(state: &State<GatewayState>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        dcap_library_available: state.dcap_library_available,
        cache: state.cache.stats(),
    })
}

/// Mounted under `/api/v1`.
pub fn routes() -> Vec<Route> {
    routes![verify, history, capture_baseline, invalidate, registration]
}

/// Mounted under `/`.
pub fn health_routes() -> Vec<Route> {
    routes![health]
}
