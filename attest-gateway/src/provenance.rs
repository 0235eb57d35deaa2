// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Build provenance of the registered image, checked against GitHub artifact
//! attestations.
//!
//! The DSSE envelope is decoded and its in-toto statement compared with the
//! registration. Sigstore signature verification is not performed here.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gate_types::{GithubResult, Registration};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use x509_parser::prelude::{parse_x509_certificate, GeneralName};

use crate::GateError;

pub mod oci;

const SLSA_PROVENANCE_V1: &str = "https://slsa.dev/provenance/v1";

#[async_trait]
pub trait ProvenanceCheck: Send + Sync {
    /// Never fails: lookup errors come back as an unverified result.
    async fn verify(&self, registration: &Registration) -> GithubResult;
}

#[derive(Debug, Deserialize)]
struct AttestationsResponse {
    #[serde(default)]
    attestations: Vec<AttestationEntry>,
}

#[derive(Debug, Deserialize)]
struct AttestationEntry {
    bundle: Bundle,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    #[serde(default)]
    verification_material: Option<VerificationMaterial>,
    #[serde(default)]
    dsse_envelope: Option<DsseEnvelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMaterial {
    #[serde(default)]
    certificate: Option<RawCertificate>,
    #[serde(default)]
    x509_certificate_chain: Option<CertificateChain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
struct CertificateChain {
    #[serde(default)]
    certificates: Vec<RawCertificate>,
}

#[derive(Debug, Deserialize)]
struct DsseEnvelope {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statement {
    #[serde(default)]
    subject: Vec<Subject>,
    predicate_type: String,
    predicate: Predicate,
}

#[derive(Debug, Deserialize)]
struct Subject {
    #[serde(default)]
    digest: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Predicate {
    build_definition: BuildDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildDefinition {
    external_parameters: ExternalParameters,
    #[serde(default)]
    internal_parameters: Option<InternalParameters>,
}

#[derive(Debug, Deserialize)]
struct ExternalParameters {
    workflow: WorkflowParameters,
}

#[derive(Debug, Deserialize)]
struct WorkflowParameters {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct InternalParameters {
    #[serde(default)]
    github: Option<GithubParameters>,
}

#[derive(Debug, Deserialize)]
struct GithubParameters {
    #[serde(default)]
    event_name: Option<String>,
}

/// What a registration claims about its image.
#[derive(Debug, Clone)]
struct Expected<'a> {
    digest: &'a str,
    org: &'a str,
    repo: &'a str,
    workflow: &'a str,
}

impl Expected<'_> {
    fn repository_url(&self) -> String {
        format!("https://github.com/{}/{}", self.org, self.repo)
    }
}

fn signer_identity(material: Option<&VerificationMaterial>) -> Option<String> {
    let material = material?;
    let raw = match &material.certificate {
        Some(cert) => cert,
        None => material.x509_certificate_chain.as_ref()?.certificates.first()?,
    };
    let der = STANDARD.decode(&raw.raw_bytes).ok()?;
    let (_, cert) = parse_x509_certificate(&der).ok()?;
    let san = cert.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::URI(uri) => Some(uri.to_string()),
        _ => None,
    })
}

fn check_bundle(bundle: &Bundle, expected: &Expected) -> GithubResult {
    let Some(envelope) = &bundle.dsse_envelope else {
        return GithubResult::failed("attestation bundle has no DSSE envelope");
    };
    let statement: Statement = match STANDARD
        .decode(&envelope.payload)
        .context("payload is not base64")
        .and_then(|raw| serde_json::from_slice(&raw).context("payload is not an in-toto statement"))
    {
        Ok(statement) => statement,
        Err(e) => return GithubResult::failed(format!("malformed attestation payload: {e:#}")),
    };

    if !statement.predicate_type.starts_with(SLSA_PROVENANCE_V1) {
        return GithubResult::failed(format!(
            "unsupported predicate type: {}",
            statement.predicate_type
        ));
    }

    let want = expected.digest.trim_start_matches("sha256:");
    let subject_matches = statement.subject.iter().any(|s| {
        s.digest
            .get("sha256")
            .is_some_and(|d| d.eq_ignore_ascii_case(want))
    });
    if !subject_matches {
        return GithubResult::failed(format!(
            "attestation subject does not cover {}",
            expected.digest
        ));
    }

    let build = &statement.predicate.build_definition;
    let workflow = &build.external_parameters.workflow;
    let workflow_ref = format!("{}@{}", workflow.path, workflow.git_ref);
    let build_trigger = build
        .internal_parameters
        .as_ref()
        .and_then(|p| p.github.as_ref())
        .and_then(|g| g.event_name.clone());
    let signer = signer_identity(bundle.verification_material.as_ref());
    let base = GithubResult {
        verified: false,
        signer_identity: signer.clone(),
        workflow_ref: Some(workflow_ref),
        build_trigger,
        repository: Some(workflow.repository.clone()),
        error: None,
    };

    let repository_url = expected.repository_url();
    if !workflow.repository.eq_ignore_ascii_case(&repository_url) {
        return GithubResult {
            error: Some(format!(
                "repository mismatch: expected {repository_url}, got {}",
                workflow.repository
            )),
            ..base
        };
    }
    let path = workflow.path.trim_start_matches("./");
    if path != expected.workflow.trim_start_matches("./") {
        return GithubResult {
            error: Some(format!(
                "workflow mismatch: expected {}, got {path}",
                expected.workflow
            )),
            ..base
        };
    }
    if let Some(signer) = &signer {
        let prefix = format!("{repository_url}/").to_ascii_lowercase();
        if !signer.to_ascii_lowercase().starts_with(&prefix) {
            return GithubResult {
                error: Some(format!("signer {signer} is not a workflow of {repository_url}")),
                ..base
            };
        }
    }
    GithubResult {
        verified: true,
        repository: Some(format!("{}/{}", expected.org, expected.repo)),
        ..base
    }
}

/// GitHub artifact attestations, with OCI registry tag resolution.
pub struct GithubProvenance {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubProvenance {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("attest-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn lookup(&self, registration: &Registration) -> Result<GithubResult> {
        let digest = match &registration.image_digest {
            Some(digest) => digest.clone(),
            None => oci::resolve_digest(
                &self.client,
                &registration.image_repository,
                &registration.image_tag,
            )
            .await
            .context("failed to resolve image tag")?,
        };
        debug!(registration = %registration.id, %digest, "looking up build provenance");

        let url = format!(
            "{}/users/{}/attestations/{digest}",
            self.api_base, registration.github_org
        );
        let mut request = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("GitHub API request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(GithubResult::failed(format!(
                "no attestation found for {digest}"
            )));
        }
        if !response.status().is_success() {
            bail!("GitHub API returned HTTP {}", response.status().as_u16());
        }
        let body: AttestationsResponse = response
            .json()
            .await
            .context("failed to parse GitHub attestations")?;
        if body.attestations.is_empty() {
            return Ok(GithubResult::failed("no attestations in response"));
        }

        let expected = Expected {
            digest: &digest,
            org: &registration.github_org,
            repo: &registration.github_repo,
            workflow: &registration.github_workflow,
        };
        let mut first_failure = None;
        for entry in &body.attestations {
            let result = check_bundle(&entry.bundle, &expected);
            if result.verified {
                return Ok(result);
            }
            first_failure.get_or_insert(result);
        }
        Ok(first_failure.unwrap_or_else(|| GithubResult::failed("no usable attestation")))
    }
}

#[async_trait]
impl ProvenanceCheck for GithubProvenance {
    async fn verify(&self, registration: &Registration) -> GithubResult {
        match self.lookup(registration).await {
            Ok(result) => result,
            Err(e) => {
                let err = GateError::ProvenanceLookupFailed(format!("{e:#}"));
                warn!(registration = %registration.id, "{err}");
                GithubResult::failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

    fn expected() -> Expected<'static> {
        Expected {
            digest: DIGEST,
            org: "acme",
            repo: "hello",
            workflow: ".github/workflows/build.yml",
        }
    }

    fn bundle(repository: &str, path: &str, digest: &str) -> Bundle {
        let statement = serde_json::json!({
            "_type": "https://in-toto.io/Statement/v1",
            "subject": [{"name": "ghcr.io/acme/hello", "digest": {"sha256": digest}}],
            "predicateType": "https://slsa.dev/provenance/v1",
            "predicate": {
                "buildDefinition": {
                    "buildType": "https://actions.github.io/buildtypes/workflow/v1",
                    "externalParameters": {
                        "workflow": {"ref": "refs/heads/main", "repository": repository, "path": path}
                    },
                    "internalParameters": {"github": {"event_name": "push"}}
                }
            }
        });
        let payload = STANDARD.encode(serde_json::to_vec(&statement).unwrap());
        serde_json::from_value(serde_json::json!({
            "mediaType": "application/vnd.dev.sigstore.bundle.v0.3+json",
            "dsseEnvelope": {"payload": payload, "payloadType": "application/vnd.in-toto+json"}
        }))
        .unwrap()
    }

    #[test]
    fn matching_statement_verifies() {
        let digest = DIGEST.trim_start_matches("sha256:");
        let result = check_bundle(
            &bundle("https://github.com/Acme/Hello", ".github/workflows/build.yml", digest),
            &expected(),
        );
        assert!(result.verified, "{result:?}");
        assert_eq!(result.repository.as_deref(), Some("acme/hello"));
        assert_eq!(
            result.workflow_ref.as_deref(),
            Some(".github/workflows/build.yml@refs/heads/main")
        );
        assert_eq!(result.build_trigger.as_deref(), Some("push"));
        assert!(result.signer_identity.is_none());
    }

    #[test]
    fn repository_and_workflow_must_match() {
        let digest = DIGEST.trim_start_matches("sha256:");
        let other_repo = check_bundle(
            &bundle("https://github.com/evil/hello", ".github/workflows/build.yml", digest),
            &expected(),
        );
        assert!(!other_repo.verified);
        assert!(other_repo.error.unwrap().starts_with("repository mismatch"));

        let other_workflow = check_bundle(
            &bundle("https://github.com/acme/hello", ".github/workflows/release.yml", digest),
            &expected(),
        );
        assert!(!other_workflow.verified);
        assert!(other_workflow.error.unwrap().starts_with("workflow mismatch"));
    }

    #[test]
    fn subject_digest_must_cover_image() {
        let result = check_bundle(
            &bundle(
                "https://github.com/acme/hello",
                ".github/workflows/build.yml",
                &"2".repeat(64),
            ),
            &expected(),
        );
        assert!(!result.verified);
        assert!(result.error.unwrap().contains("does not cover"));
    }

    #[test]
    fn missing_or_garbled_envelope() {
        let empty: Bundle = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(
            check_bundle(&empty, &expected()).error.as_deref(),
            Some("attestation bundle has no DSSE envelope")
        );
        let garbled: Bundle =
            serde_json::from_value(serde_json::json!({"dsseEnvelope": {"payload": "%%%"}})).unwrap();
        assert!(check_bundle(&garbled, &expected())
            .error
            .unwrap()
            .starts_with("malformed attestation payload"));
    }

    #[test]
    fn unparseable_certificate_gives_no_signer() {
        let material: VerificationMaterial =
            serde_json::from_value(serde_json::json!({"certificate": {"rawBytes": "AAAA"}})).unwrap();
        assert!(signer_identity(Some(&material)).is_none());
    }

    #[tokio::test]
    async fn unreachable_api_is_an_unverified_result() {
        let provenance = GithubProvenance::new("http://127.0.0.1:9", None).unwrap();
        let registration: Registration = serde_json::from_value(serde_json::json!({
            "id": "app",
            "name": "app",
            "image_repository": "ghcr.io/acme/hello",
            "image_digest": DIGEST,
            "github_org": "acme",
            "github_repo": "hello",
            "app_endpoint": "http://127.0.0.1:1",
            "tdx_proxy_endpoint": "http://127.0.0.1:1"
        }))
        .unwrap();
        let result = provenance.verify(&registration).await;
        assert!(!result.verified);
        assert!(result.error.unwrap().starts_with("provenance lookup failed"));
    }
}
