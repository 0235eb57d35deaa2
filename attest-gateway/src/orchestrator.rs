// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use gate_types::{
    Baseline, DcapResult, GithubResult, MeasurementResult, Measurements, QuoteMethod,
    Registration, TdQuote, VerificationResult, VerificationStatus, REPORT_DATA_SIZE,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dcap::QuoteVerifier;
use crate::measurement;
use crate::provenance::ProvenanceCheck;
use crate::quote_client::QuoteFetcher;
use crate::store::RegistrationStore;
use crate::GateError;

const NOT_ATTEMPTED: &str = "not attempted: quote unavailable";

/// One verification run per call, no memoization. The cache sits on top.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Never fails; every fault ends up in the returned verdict.
    async fn verify(&self, registration_id: &str, quote_override: Option<String>)
        -> VerificationResult;

    async fn capture_baseline(
        &self,
        registration_id: &str,
        force: bool,
    ) -> Result<(Baseline, DateTime<Utc>), GateError>;
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub quote: Duration,
    pub dcap: Duration,
    pub provenance: Duration,
}

impl Timeouts {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            quote: config.quote_timeout(),
            dcap: config.dcap_timeout(),
            provenance: config.provenance_timeout(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// A quote and what could be read out of it.
struct Evidence {
    raw: Vec<u8>,
    measurements: Result<Measurements, String>,
    /// Report data of a parsed quote.
    report_data: Option<[u8; REPORT_DATA_SIZE]>,
    nonce: Option<[u8; REPORT_DATA_SIZE]>,
    method: QuoteMethod,
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    if let Err(err) = getrandom::fill(&mut bytes) {
        warn!("getrandom failed, falling back to clock-based id: {err}");
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes[..8].copy_from_slice(&nanos.to_le_bytes());
    }
    hex::encode(bytes)
}

pub struct Orchestrator {
    store: Arc<dyn RegistrationStore>,
    fetcher: Arc<dyn QuoteFetcher>,
    dcap: Arc<dyn QuoteVerifier>,
    provenance: Arc<dyn ProvenanceCheck>,
    timeouts: Timeouts,
    bind_nonce: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        fetcher: Arc<dyn QuoteFetcher>,
        dcap: Arc<dyn QuoteVerifier>,
        provenance: Arc<dyn ProvenanceCheck>,
    ) -> Self {
        Self {
            store,
            fetcher,
            dcap,
            provenance,
            timeouts: Timeouts::default(),
            bind_nonce: true,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_nonce_binding(mut self, bind_nonce: bool) -> Self {
        self.bind_nonce = bind_nonce;
        self
    }

    fn decode_override(quote_base64: &str) -> Result<Evidence, GateError> {
        let raw = STANDARD
            .decode(quote_base64.trim())
            .map_err(|e| GateError::QuoteUnavailable(format!("invalid quote override: {e}")))?;
        let parsed = TdQuote::parse(&raw).map_err(|e| format!("{e:#}"));
        Ok(Evidence {
            raw,
            report_data: parsed.as_ref().ok().map(|q| q.report_data),
            measurements: parsed.map(|q| q.measurements),
            nonce: None,
            method: QuoteMethod::Override,
        })
    }

    async fn fetch_quote(&self, registration: &Registration) -> Result<Evidence, GateError> {
        let nonce = if self.bind_nonce {
            let mut nonce = [0u8; REPORT_DATA_SIZE];
            getrandom::fill(&mut nonce).map_err(|e| anyhow!("failed to generate nonce: {e}"))?;
            Some(nonce)
        } else {
            None
        };
        let response = timeout(
            self.timeouts.quote,
            self.fetcher
                .fetch(&registration.tdx_proxy_endpoint, nonce.as_ref()),
        )
        .await
        .map_err(|_| {
            GateError::QuoteUnavailable(format!(
                "quote source timed out after {}s",
                self.timeouts.quote.as_secs_f32()
            ))
        })??;

        let (measurements, report_data) = match TdQuote::parse(&response.quote) {
            Ok(parsed) => {
                if parsed.measurements != lowercase(&response.measurements) {
                    warn!(
                        registration = %registration.id,
                        "quote source reported measurements that differ from its quote"
                    );
                }
                (parsed.measurements, Some(parsed.report_data))
            }
            Err(err) => {
                debug!(
                    registration = %registration.id,
                    "quote did not parse, using reported measurements: {err:#}"
                );
                (lowercase(&response.measurements), None)
            }
        };
        Ok(Evidence {
            raw: response.quote,
            measurements: Ok(measurements),
            report_data,
            nonce,
            method: response.method,
        })
    }

    async fn obtain(
        &self,
        registration: &Registration,
        quote_override: Option<String>,
    ) -> Result<Evidence, GateError> {
        match quote_override {
            Some(quote) => Self::decode_override(&quote),
            None => self.fetch_quote(registration).await,
        }
    }

    async fn run_dcap(&self, evidence: &Evidence) -> DcapResult {
        let dcap = self.dcap.clone();
        let raw = evidence.raw.clone();
        let result = match timeout(
            self.timeouts.dcap,
            tokio::task::spawn_blocking(move || dcap.verify(&raw)),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => DcapResult::failed("ERROR", format!("DCAP verification aborted: {err}")),
            Err(_) => DcapResult::failed(
                "TIMEOUT",
                format!(
                    "DCAP verification timed out after {}s",
                    self.timeouts.dcap.as_secs_f32()
                ),
            ),
        };
        match (evidence.nonce, evidence.report_data) {
            (Some(nonce), Some(report_data)) if nonce != report_data => DcapResult {
                verified: false,
                status: "REPORT_DATA_MISMATCH".into(),
                error: Some("quote report data does not match the request nonce".into()),
                ..result
            },
            _ => result,
        }
    }

    async fn run_provenance(&self, registration: &Registration) -> GithubResult {
        match timeout(
            self.timeouts.provenance,
            self.provenance.verify(registration),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => GithubResult::failed(
                GateError::ProvenanceLookupFailed(format!(
                    "timed out after {}s",
                    self.timeouts.provenance.as_secs_f32()
                ))
                .to_string(),
            ),
        }
    }

    async fn record(&self, result: &VerificationResult) {
        if let Err(err) = self.store.append_history(result.clone()).await {
            warn!(registration = %result.registration_id, "failed to record history: {err}");
        }
    }
}

fn lowercase(m: &Measurements) -> Measurements {
    Measurements {
        mrtd: m.mrtd.to_ascii_lowercase(),
        rtmr0: m.rtmr0.to_ascii_lowercase(),
        rtmr1: m.rtmr1.to_ascii_lowercase(),
        rtmr2: m.rtmr2.to_ascii_lowercase(),
        rtmr3: m.rtmr3.to_ascii_lowercase(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Verdict for a run that never got as far as running the checks.
pub(crate) fn failed_result(registration_id: &str, error: String, started: Instant) -> VerificationResult {
    VerificationResult {
        id: random_id(),
        registration_id: registration_id.to_string(),
        status: VerificationStatus::Failed,
        dcap: DcapResult::failed("NOT_ATTEMPTED", error.clone()),
        github: GithubResult::failed("not attempted"),
        measurements: MeasurementResult::failed("not attempted"),
        duration_ms: elapsed_ms(started),
        verified_at: Utc::now(),
        quote_method: None,
        error: Some(error),
    }
}

#[async_trait]
impl Pipeline for Orchestrator {
    async fn verify(
        &self,
        registration_id: &str,
        quote_override: Option<String>,
    ) -> VerificationResult {
        let started = Instant::now();
        let Some(registration) = self.store.registration(registration_id).await else {
            return failed_result(
                registration_id,
                GateError::UnknownRegistration(registration_id.to_string()).to_string(),
                started,
            );
        };

        let evidence = match self.obtain(&registration, quote_override).await {
            Ok(evidence) => evidence,
            Err(err) => {
                warn!(registration = %registration.id, "{err}");
                let error = err.to_string();
                let result = VerificationResult {
                    dcap: DcapResult::failed("QUOTE_UNAVAILABLE", error.clone()),
                    github: GithubResult::failed(NOT_ATTEMPTED),
                    measurements: MeasurementResult::failed(NOT_ATTEMPTED),
                    ..failed_result(&registration.id, error, started)
                };
                self.record(&result).await;
                return result;
            }
        };

        let (dcap, github) = tokio::join!(
            self.run_dcap(&evidence),
            self.run_provenance(&registration)
        );
        let measurements = match &evidence.measurements {
            Ok(actual) => measurement::compare(actual, registration.baseline.as_ref()),
            Err(err) => MeasurementResult::failed(format!("cannot read measurements: {err}")),
        };
        let status =
            VerificationStatus::aggregate(dcap.verified, github.verified, measurements.verified);

        let result = VerificationResult {
            id: random_id(),
            registration_id: registration.id.clone(),
            status,
            dcap,
            github,
            measurements,
            duration_ms: elapsed_ms(started),
            verified_at: Utc::now(),
            quote_method: Some(evidence.method),
            error: None,
        };
        info!(
            registration = %result.registration_id,
            status = %result.status,
            dcap = %result.dcap.status,
            mock = result.dcap.mock,
            duration_ms = result.duration_ms,
            "verification finished"
        );
        self.record(&result).await;
        result
    }

    async fn capture_baseline(
        &self,
        registration_id: &str,
        force: bool,
    ) -> Result<(Baseline, DateTime<Utc>), GateError> {
        let registration = self
            .store
            .registration(registration_id)
            .await
            .ok_or_else(|| GateError::UnknownRegistration(registration_id.to_string()))?;
        if registration.baseline.is_some() && !force {
            return Err(GateError::BaselineAlreadyCaptured(registration.id));
        }

        let evidence = self.fetch_quote(&registration).await?;
        let dcap = self.run_dcap(&evidence).await;
        if !dcap.verified {
            return Err(GateError::EvidenceRejected(format!(
                "{}: {}",
                dcap.status,
                dcap.error.as_deref().unwrap_or("DCAP verification failed")
            )));
        }
        if dcap.mock {
            warn!(registration = %registration.id, "capturing baseline from a mock-verified quote");
        }
        let measurements = evidence
            .measurements
            .map_err(GateError::EvidenceRejected)?;
        let baseline = Baseline::from(lowercase(&measurements));
        self.store
            .set_baseline(&registration.id, baseline.clone())
            .await?;
        info!(registration = %registration.id, force, "baseline captured");
        Ok((baseline, Utc::now()))
    }
}
