// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Measurements, QuoteMethod};

/// Aggregate verdict of one verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Success,
    Partial,
    Failed,
    Pending,
}

impl VerificationStatus {
    /// DCAP failure is fatal; anything short of three passes is partial.
    pub fn aggregate(dcap: bool, github: bool, measurements: bool) -> Self {
        match (dcap, github, measurements) {
            (false, _, _) => Self::Failed,
            (true, true, true) => Self::Success,
            _ => Self::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcapResult {
    pub verified: bool,
    /// QVL status name (`OK`, `OUT_OF_DATE`, ...) or `MOCK`.
    pub status: String,
    pub tcb_status: Option<String>,
    pub collateral_expiry: Option<DateTime<Utc>>,
    /// Set when the result came from structural validation only.
    #[serde(default)]
    pub mock: bool,
    pub error: Option<String>,
}

impl DcapResult {
    pub fn failed(status: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            verified: false,
            status: status.into(),
            tcb_status: None,
            collateral_expiry: None,
            mock: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubResult {
    pub verified: bool,
    pub signer_identity: Option<String>,
    pub workflow_ref: Option<String>,
    pub build_trigger: Option<String>,
    pub repository: Option<String>,
    pub error: Option<String>,
}

impl GithubResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub verified: bool,
    pub mrtd_match: bool,
    pub rtmr0_match: bool,
    pub rtmr1_match: bool,
    pub rtmr2_match: bool,
    pub rtmr3_match: bool,
    pub actual: Option<Measurements>,
    pub expected: Option<Measurements>,
    pub error: Option<String>,
}

impl MeasurementResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One verdict per registration and point in time. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: String,
    pub registration_id: String,
    pub status: VerificationStatus,
    pub dcap: DcapResult,
    pub github: GithubResult,
    pub measurements: MeasurementResult,
    pub duration_ms: u64,
    pub verified_at: DateTime<Utc>,
    pub quote_method: Option<QuoteMethod>,
    pub error: Option<String>,
}

impl VerificationResult {
    /// Error text of the first failing check, in DCAP, provenance, measurement order.
    pub fn first_failure(&self) -> Option<&str> {
        if let Some(error) = &self.error {
            return Some(error);
        }
        if !self.dcap.verified {
            return Some(self.dcap.error.as_deref().unwrap_or("DCAP verification failed"));
        }
        if !self.github.verified {
            return Some(
                self.github
                    .error
                    .as_deref()
                    .unwrap_or("provenance verification failed"),
            );
        }
        if !self.measurements.verified {
            return Some(
                self.measurements
                    .error
                    .as_deref()
                    .unwrap_or("measurement mismatch"),
            );
        }
        None
    }

    pub fn is_success(&self) -> bool {
        self.status == VerificationStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dcap_failure_is_fatal_for_every_combination() {
        for github in [false, true] {
            for meas in [false, true] {
                assert_eq!(
                    VerificationStatus::aggregate(false, github, meas),
                    VerificationStatus::Failed
                );
            }
        }
        assert_eq!(
            VerificationStatus::aggregate(true, true, true),
            VerificationStatus::Success
        );
        assert_eq!(
            VerificationStatus::aggregate(true, false, true),
            VerificationStatus::Partial
        );
        assert_eq!(
            VerificationStatus::aggregate(true, true, false),
            VerificationStatus::Partial
        );
    }

    #[test]
    fn first_failure_follows_check_order() {
        let mut result = VerificationResult {
            id: "v1".into(),
            registration_id: "app".into(),
            status: VerificationStatus::Partial,
            dcap: DcapResult {
                verified: true,
                status: "OK".into(),
                tcb_status: Some("UpToDate".into()),
                collateral_expiry: None,
                mock: false,
                error: None,
            },
            github: GithubResult::failed("no attestation found"),
            measurements: MeasurementResult::failed("no baseline captured"),
            duration_ms: 3,
            verified_at: Utc::now(),
            quote_method: Some(QuoteMethod::Configfs),
            error: None,
        };
        assert_eq!(result.first_failure(), Some("no attestation found"));
        result.github.verified = true;
        assert_eq!(result.first_failure(), Some("no baseline captured"));
        result.measurements.verified = true;
        assert_eq!(result.first_failure(), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&VerificationStatus::Partial).unwrap(),
            r#""partial""#
        );
    }
}
