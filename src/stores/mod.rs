pub mod local;
pub mod oci;

use crate::reference::ArtifactReference;
use crate::{Result, TrustError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use local::LocalStore;
pub use oci::OciStore;

/// Artifact type of key based (cosign style) signatures.
pub const COSIGN_ARTIFACT_TYPE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";

/// Artifact type of certificate chain (notation style) signatures.
pub const NOTATION_ARTIFACT_TYPE: &str = "application/vnd.cncf.notary.signature";

/// One signature object attached to an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMetadata {
    /// Digest of the artifact the signature refers to
    pub subject_digest: String,
    pub artifact_type: String,
    /// Digest identifying the signature object itself
    pub digest: String,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    /// DER certificates, leaf first
    pub certificate_chain: Vec<Vec<u8>>,
    pub annotations: BTreeMap<String, String>,
}

/// Wire form of a signature object as stored in a registry blob or file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEnvelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact_type: String,
    pub payload: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificate_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl SignatureEnvelope {
    pub fn new(artifact_type: &str, payload: &[u8], signature: &[u8]) -> Self {
        Self {
            artifact_type: artifact_type.to_string(),
            payload: BASE64.encode(payload),
            signature: BASE64.encode(signature),
            ..Default::default()
        }
    }

    pub fn with_certificate_chain(mut self, chain: &[Vec<u8>]) -> Self {
        self.certificate_chain = chain.iter().map(|der| BASE64.encode(der)).collect();
        self
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TrustError::Store(format!("malformed signature envelope: {}", e)))
    }

    /// Decode into metadata. `fallback_artifact_type` applies when the
    /// envelope does not name its own type.
    pub fn into_metadata(
        self,
        subject_digest: &str,
        digest: String,
        fallback_artifact_type: &str,
    ) -> Result<SignatureMetadata> {
        let decode = |field: &str, value: &str| {
            BASE64.decode(value).map_err(|e| {
                TrustError::Store(format!("failed to decode signature {} {}: {}", digest, field, e))
            })
        };

        let payload = decode("payload", &self.payload)?;
        let signature = decode("signature", &self.signature)?;
        let certificate_chain = self
            .certificate_chain
            .iter()
            .map(|der| decode("certificate", der))
            .collect::<Result<Vec<_>>>()?;

        let artifact_type = if self.artifact_type.is_empty() {
            fallback_artifact_type.to_string()
        } else {
            self.artifact_type
        };

        Ok(SignatureMetadata {
            subject_digest: subject_digest.to_string(),
            artifact_type,
            digest,
            payload,
            signature,
            certificate_chain,
            annotations: self.annotations,
        })
    }
}

/// Source of signature metadata for artifacts.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve the reference to the digest of its manifest.
    async fn resolve_digest(&self, reference: &ArtifactReference) -> Result<String>;

    /// Fetch every signature object attached to `subject_digest`. An artifact
    /// without signatures yields an empty list.
    async fn fetch_signature_metadata(
        &self,
        reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<Vec<SignatureMetadata>>;

    /// Get the store type name for logging
    fn store_type(&self) -> &'static str;
}
