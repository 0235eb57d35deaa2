// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tag to digest resolution against an OCI distribution registry.

use anyhow::{bail, Context, Result};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::debug;

const DOCKER_HUB: &str = "registry-1.docker.io";
const ACCEPT_MANIFESTS: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub scheme: &'static str,
    pub registry: String,
    pub name: String,
}

impl ImageReference {
    /// `ghcr.io/acme/app`, `nginx`, `localhost:5000/app`, `http://registry.lan/app`.
    pub fn parse(repository: &str) -> Result<Self> {
        let (scheme, rest) = match repository.split_once("://") {
            Some(("http", rest)) => ("http", rest),
            Some(("https", rest)) => ("https", rest),
            Some((other, _)) => bail!("unsupported registry scheme: {other}"),
            None => ("https", repository),
        };
        let rest = rest.trim_matches('/');
        if rest.is_empty() {
            bail!("empty image repository");
        }
        let (registry, name) = match rest.split_once('/') {
            Some((host, name))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), name.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), rest.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{rest}")),
        };
        let registry = if registry == "docker.io" {
            DOCKER_HUB.to_string()
        } else {
            registry
        };
        Ok(Self {
            scheme,
            registry,
            name,
        })
    }

    fn manifest_url(&self, tag: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{tag}",
            self.scheme, self.registry, self.name
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// `Bearer realm="...",service="...",scope="..."`
fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let params = value.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.strip_prefix('"')?;
        let (val, after_val) = after_key.split_once('"')?;
        match key.trim() {
            "realm" => realm = Some(val.to_string()),
            "service" => service = Some(val.to_string()),
            "scope" => scope = Some(val.to_string()),
            _ => {}
        }
        rest = after_val.trim_start_matches(',').trim();
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

async fn fetch_token(client: &reqwest::Client, challenge: &BearerChallenge) -> Result<String> {
    let mut query = Vec::new();
    if let Some(service) = &challenge.service {
        query.push(("service", service.as_str()));
    }
    if let Some(scope) = &challenge.scope {
        query.push(("scope", scope.as_str()));
    }
    let response = client
        .get(&challenge.realm)
        .query(&query)
        .send()
        .await
        .context("registry token request failed")?;
    if !response.status().is_success() {
        bail!("registry token endpoint returned HTTP {}", response.status().as_u16());
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("failed to parse registry token")?;
    token
        .token
        .or(token.access_token)
        .context("registry token response carries no token")
}

/// Resolve `repository:tag` to its manifest digest (`sha256:...`).
pub async fn resolve_digest(client: &reqwest::Client, repository: &str, tag: &str) -> Result<String> {
    let image = ImageReference::parse(repository)?;
    let url = image.manifest_url(tag);
    debug!(%url, "resolving image tag");

    let mut response = client
        .head(&url)
        .header(header::ACCEPT, ACCEPT_MANIFESTS)
        .send()
        .await
        .context("registry request failed")?;

    if response.status() == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .context("registry requires authentication but sent no bearer challenge")?;
        let token = fetch_token(client, &challenge).await?;
        response = client
            .head(&url)
            .header(header::ACCEPT, ACCEPT_MANIFESTS)
            .bearer_auth(token)
            .send()
            .await
            .context("registry request failed")?;
    }

    if !response.status().is_success() {
        bail!(
            "registry returned HTTP {} for {}:{tag}",
            response.status().as_u16(),
            repository
        );
    }
    let digest = response
        .headers()
        .get("docker-content-digest")
        .and_then(|v| v.to_str().ok())
        .context("registry response has no Docker-Content-Digest")?;
    if !digest.starts_with("sha256:") {
        bail!("unsupported digest algorithm: {digest}");
    }
    Ok(digest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_hosts() {
        let ghcr = ImageReference::parse("ghcr.io/acme/hello").unwrap();
        assert_eq!(ghcr.registry, "ghcr.io");
        assert_eq!(ghcr.name, "acme/hello");
        assert_eq!(
            ghcr.manifest_url("v1"),
            "https://ghcr.io/v2/acme/hello/manifests/v1"
        );

        let hub = ImageReference::parse("nginx").unwrap();
        assert_eq!(hub.registry, "registry-1.docker.io");
        assert_eq!(hub.name, "library/nginx");

        let org = ImageReference::parse("docker.io/acme/app").unwrap();
        assert_eq!(org.registry, "registry-1.docker.io");
        assert_eq!(org.name, "acme/app");

        let local = ImageReference::parse("http://localhost:5000/app").unwrap();
        assert_eq!(local.scheme, "http");
        assert_eq!(local.registry, "localhost:5000");

        assert!(ImageReference::parse("ftp://x/y").is_err());
    }

    #[test]
    fn parses_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:acme/hello:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:acme/hello:pull"));

        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }
}
