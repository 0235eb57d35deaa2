// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Baseline;

const DEFAULT_IMAGE_TAG: &str = "latest";
const DEFAULT_WORKFLOW: &str = ".github/workflows/build.yml";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("{field} must start with http:// or https://")]
    InvalidEndpoint { field: &'static str },
    #[error("image digest must look like sha256:<64 hex chars>")]
    InvalidDigest,
    #[error("baseline is partial: {0} is missing")]
    PartialBaseline(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// An application registered for attestation-gated access.
///
/// Created by an external registrar. The gateway only ever changes the baseline,
/// and only through an explicit capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RegistrationRecord", into = "RegistrationRecord")]
pub struct Registration {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub image_repository: String,
    pub image_tag: String,
    pub image_digest: Option<String>,
    pub github_org: String,
    pub github_repo: String,
    pub github_workflow: String,
    pub app_endpoint: String,
    pub tdx_proxy_endpoint: String,
    pub baseline: Option<Baseline>,
}

/// Flat on-disk/over-the-wire form, baseline registers as optional columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image_repository: String,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub image_digest: Option<String>,
    pub github_org: String,
    pub github_repo: String,
    #[serde(default)]
    pub github_workflow: Option<String>,
    pub app_endpoint: String,
    pub tdx_proxy_endpoint: String,
    #[serde(default)]
    pub expected_mrtd: Option<String>,
    #[serde(default)]
    pub expected_rtmr0: Option<String>,
    #[serde(default)]
    pub expected_rtmr1: Option<String>,
    #[serde(default)]
    pub expected_rtmr2: Option<String>,
    #[serde(default)]
    pub expected_rtmr3: Option<String>,
}

fn normalize_endpoint(field: &'static str, url: String) -> Result<String, RegistrationError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(RegistrationError::InvalidEndpoint { field });
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn is_valid_digest(digest: &str) -> bool {
    let Some(hex) = digest.strip_prefix("sha256:") else {
        return false;
    };
    hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl TryFrom<RegistrationRecord> for Registration {
    type Error = RegistrationError;

    fn try_from(r: RegistrationRecord) -> Result<Self, Self::Error> {
        if r.id.is_empty() {
            return Err(RegistrationError::Empty("id"));
        }
        if r.github_org.is_empty() || r.github_repo.is_empty() {
            return Err(RegistrationError::Empty("github_org/github_repo"));
        }
        if let Some(digest) = &r.image_digest {
            if !is_valid_digest(digest) {
                return Err(RegistrationError::InvalidDigest);
            }
        }
        let registers = [
            ("expected_mrtd", r.expected_mrtd),
            ("expected_rtmr0", r.expected_rtmr0),
            ("expected_rtmr1", r.expected_rtmr1),
            ("expected_rtmr2", r.expected_rtmr2),
            ("expected_rtmr3", r.expected_rtmr3),
        ];
        let baseline = if registers.iter().all(|(_, v)| v.is_none()) {
            None
        } else {
            let mut values = Vec::with_capacity(5);
            for (name, value) in registers {
                values.push(value.ok_or(RegistrationError::PartialBaseline(name))?);
            }
            let [mrtd, rtmr0, rtmr1, rtmr2, rtmr3]: [String; 5] = values
                .try_into()
                .map_err(|_| RegistrationError::PartialBaseline("expected_mrtd"))?;
            Some(Baseline {
                mrtd,
                rtmr0,
                rtmr1,
                rtmr2,
                rtmr3,
            })
        };
        Ok(Self {
            app_endpoint: normalize_endpoint("app_endpoint", r.app_endpoint)?,
            tdx_proxy_endpoint: normalize_endpoint("tdx_proxy_endpoint", r.tdx_proxy_endpoint)?,
            id: r.id,
            name: r.name,
            description: r.description,
            image_repository: r.image_repository,
            image_tag: r
                .image_tag
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string()),
            image_digest: r.image_digest,
            github_org: r.github_org,
            github_repo: r.github_repo,
            github_workflow: r
                .github_workflow
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| DEFAULT_WORKFLOW.to_string()),
            baseline,
        })
    }
}

impl From<Registration> for RegistrationRecord {
    fn from(r: Registration) -> Self {
        let baseline = r.baseline;
        Self {
            id: r.id,
            name: r.name,
            description: r.description,
            image_repository: r.image_repository,
            image_tag: Some(r.image_tag),
            image_digest: r.image_digest,
            github_org: r.github_org,
            github_repo: r.github_repo,
            github_workflow: Some(r.github_workflow),
            app_endpoint: r.app_endpoint,
            tdx_proxy_endpoint: r.tdx_proxy_endpoint,
            expected_mrtd: baseline.as_ref().map(|b| b.mrtd.clone()),
            expected_rtmr0: baseline.as_ref().map(|b| b.rtmr0.clone()),
            expected_rtmr1: baseline.as_ref().map(|b| b.rtmr1.clone()),
            expected_rtmr2: baseline.as_ref().map(|b| b.rtmr2.clone()),
            expected_rtmr3: baseline.map(|b| b.rtmr3),
        }
    }
}
