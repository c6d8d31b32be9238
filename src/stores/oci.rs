use crate::credentials::CredentialProvider;
use crate::reference::ArtifactReference;
use crate::stores::{
    SignatureEnvelope, SignatureMetadata, Store, COSIGN_ARTIFACT_TYPE, NOTATION_ARTIFACT_TYPE,
};
use crate::{sha256_digest, Result, TrustError};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const USER_AGENT_VALUE: &str = "trust-engine/0.1.0";
const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";
const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry store speaking the OCI distribution API. Signatures are
/// discovered through the referrers API; each referrer manifest's first layer
/// holds a signature envelope.
pub struct OciStore {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    plain_http: bool,
    tokens: DashMap<String, String>,
}

impl OciStore {
    pub fn new(credentials: Arc<dyn CredentialProvider>, plain_http: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            credentials,
            plain_http,
            tokens: DashMap::new(),
        })
    }

    fn repository_url(&self, reference: &ArtifactReference) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        let host = if reference.registry == DOCKER_HUB {
            DOCKER_HUB_ENDPOINT
        } else {
            reference.registry.as_str()
        };
        format!("{}://{}/v2/{}", scheme, host, reference.repository)
    }

    /// Send a request, answering one bearer challenge with a token exchange.
    async fn send(
        &self,
        reference: &ArtifactReference,
        method: Method,
        path: &str,
        accept: &str,
    ) -> Result<Response> {
        let url = format!("{}/{}", self.repository_url(reference), path);
        let token_key = reference.scope_target();
        let cached_token = self.tokens.get(&token_key).map(|token| token.clone());

        let response = self
            .request(method.clone(), &url, accept, &reference.registry, cached_token)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.len() > 7 && value[..7].eq_ignore_ascii_case("bearer "))
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.exchange_token(&challenge, &reference.registry).await?;
        self.tokens.insert(token_key, token.clone());
        self.request(method, &url, accept, &reference.registry, Some(token))
            .await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        accept: &str,
        host: &str,
        token: Option<String>,
    ) -> Result<Response> {
        trace!("{} {}", method, url);
        let mut request = self.client.request(method, url);
        if !accept.is_empty() {
            request = request.header(ACCEPT, accept);
        }
        request = match token {
            Some(token) => request.bearer_auth(token),
            None => self.credentials.credential(host).await?.apply(request),
        };
        Ok(request.send().await?)
    }

    async fn exchange_token(&self, challenge: &str, host: &str) -> Result<String> {
        let params = parse_bearer_challenge(challenge);
        let realm = params.get("realm").ok_or_else(|| {
            TrustError::Store(format!("authentication challenge from {} has no realm", host))
        })?;

        let query: Vec<(&str, &str)> = ["service", "scope"]
            .iter()
            .filter_map(|key| params.get(*key).map(|value| (*key, value.as_str())))
            .collect();

        let request = self.client.get(realm).query(&query);
        let response = self
            .credentials
            .credential(host)
            .await?
            .apply(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TrustError::Credential(format!(
                "token exchange with {} failed: {}",
                realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| TrustError::Credential(format!("token exchange with {} returned no token", realm)))
    }

    async fn get_manifest(
        &self,
        reference: &ArtifactReference,
        digest: &str,
    ) -> Result<ImageManifest> {
        let response = self
            .send(
                reference,
                Method::GET,
                &format!("manifests/{}", digest),
                OCI_MANIFEST_MEDIA_TYPE,
            )
            .await?;
        let response = error_for_status(response, reference, "signature manifest").await?;
        let body = response.bytes().await?;
        verify_content_digest(&body, digest)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_blob(&self, reference: &ArtifactReference, digest: &str) -> Result<Vec<u8>> {
        let response = self
            .send(reference, Method::GET, &format!("blobs/{}", digest), "")
            .await?;
        let response = error_for_status(response, reference, "signature blob").await?;
        let body = response.bytes().await?.to_vec();
        verify_content_digest(&body, digest)?;
        Ok(body)
    }
}

#[async_trait]
impl Store for OciStore {
    async fn resolve_digest(&self, reference: &ArtifactReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let accept = MANIFEST_MEDIA_TYPES.join(", ");
        let path = format!("manifests/{}", reference.manifest_reference());
        let response = self.send(reference, Method::HEAD, &path, &accept).await?;
        let response = error_for_status(response, reference, "manifest").await?;

        if let Some(digest) = response
            .headers()
            .get(CONTENT_DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            return Ok(digest.to_string());
        }

        // Some registries omit the digest header on HEAD.
        let response = self.send(reference, Method::GET, &path, &accept).await?;
        let response = error_for_status(response, reference, "manifest").await?;
        Ok(sha256_digest(&response.bytes().await?))
    }

    async fn fetch_signature_metadata(
        &self,
        reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<Vec<SignatureMetadata>> {
        let response = self
            .send(
                reference,
                Method::GET,
                &format!("referrers/{}", subject_digest),
                INDEX_MEDIA_TYPE,
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("no referrers for {} in {}", subject_digest, reference.scope_target());
            return Ok(Vec::new());
        }
        let response = error_for_status(response, reference, "referrers").await?;
        let index: ImageIndex = response.json().await?;

        let mut signatures = Vec::new();
        for descriptor in index.manifests {
            let artifact_type = descriptor.artifact_type.clone().unwrap_or_default();
            if !is_signature_type(&artifact_type) {
                trace!("skipping referrer {} of type {}", descriptor.digest, artifact_type);
                continue;
            }

            let manifest = self.get_manifest(reference, &descriptor.digest).await?;
            let Some(layer) = manifest.layers.first() else {
                debug!("signature manifest {} has no layers", descriptor.digest);
                continue;
            };
            trace!("fetching signature layer {} ({})", layer.digest, layer.media_type);

            let blob = self.get_blob(reference, &layer.digest).await?;
            let fallback_type = manifest.artifact_type.as_deref().unwrap_or(&artifact_type);
            let mut metadata = SignatureEnvelope::from_slice(&blob)?.into_metadata(
                subject_digest,
                descriptor.digest.clone(),
                fallback_type,
            )?;
            for (key, value) in descriptor.annotations {
                metadata.annotations.entry(key).or_insert(value);
            }
            signatures.push(metadata);
        }

        Ok(signatures)
    }

    fn store_type(&self) -> &'static str {
        "OCI"
    }
}

fn is_signature_type(artifact_type: &str) -> bool {
    artifact_type == COSIGN_ARTIFACT_TYPE || artifact_type == NOTATION_ARTIFACT_TYPE
}

async fn error_for_status(
    response: Response,
    reference: &ArtifactReference,
    what: &str,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("access denied to {} of {}", what, reference)
        }
        StatusCode::NOT_FOUND => format!("{} of {} not found", what, reference),
        _ => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            format!("registry returned {} for {} of {}: {}", status, what, reference, body)
        }
    };
    Err(TrustError::Store(message))
}

fn verify_content_digest(content: &[u8], expected: &str) -> Result<()> {
    // Only sha256 content is recomputed; other algorithms are trusted as served.
    if !expected.starts_with("sha256:") {
        return Ok(());
    }
    let actual = sha256_digest(content);
    if actual != expected {
        return Err(TrustError::Store(format!(
            "content digest mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Parse `Bearer key="value",key2="value2"` challenge parameters. Quoted
/// values may contain commas.
fn parse_bearer_challenge(challenge: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let rest = challenge.get(7..).unwrap_or_default();
    let mut chars = rest.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    params
}
