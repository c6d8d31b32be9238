use crate::keyprovider::KeyProvider;
use crate::reference::ArtifactReference;
use crate::stores::{SignatureMetadata, COSIGN_ARTIFACT_TYPE};
use crate::verifiers::{
    public_key_from_pem, verify_payload_digest, verify_with_public_key, VerificationReport,
    Verifier,
};
use crate::{Result, TrustError};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Location of the manifest digest in a cosign simple signing payload.
const SIMPLE_SIGNING_DIGEST: &[&str] = &["critical", "image", "docker-manifest-digest"];

enum KeySource {
    /// Public keys of the certificates a key provider holds
    Provider(Arc<dyn KeyProvider>),
    /// SubjectPublicKeyInfo DER of configured keys
    PublicKeys(Vec<Vec<u8>>),
}

/// Cosign-compatible verifier for key based signatures.
pub struct KeyVerifier {
    name: String,
    keys: KeySource,
}

impl KeyVerifier {
    pub fn with_key_provider(name: impl Into<String>, provider: Arc<dyn KeyProvider>) -> Self {
        Self {
            name: name.into(),
            keys: KeySource::Provider(provider),
        }
    }

    /// Load public keys from PEM strings
    pub fn with_public_keys(name: impl Into<String>, pem_keys: &[String]) -> Result<Self> {
        if pem_keys.is_empty() {
            return Err(TrustError::Config(
                "at least one public key must be specified".into(),
            ));
        }
        let keys = pem_keys
            .iter()
            .map(|pem_key| public_key_from_pem(pem_key))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.into(),
            keys: KeySource::PublicKeys(keys),
        })
    }

    async fn public_keys(&self) -> Result<Vec<Vec<u8>>> {
        match &self.keys {
            KeySource::PublicKeys(keys) => Ok(keys.clone()),
            KeySource::Provider(provider) => {
                let material = provider.get_certificates().await?;
                Ok(material
                    .iter()
                    .map(|cert| cert.public_key_der().to_vec())
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Verifier for KeyVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn verifier_type(&self) -> &'static str {
        "cosign"
    }

    fn verifiable(&self, signature: &SignatureMetadata) -> bool {
        signature.artifact_type == COSIGN_ARTIFACT_TYPE
    }

    async fn verify(
        &self,
        reference: &ArtifactReference,
        signature: &SignatureMetadata,
    ) -> Result<VerificationReport> {
        debug!("Starting Cosign verification of {} for {}", signature.digest, reference);

        let keys = self.public_keys().await?;
        let mut last_error = None;
        for key in &keys {
            match verify_with_public_key(key, &signature.signature, &signature.payload) {
                Ok(()) => {
                    verify_payload_digest(
                        &signature.payload,
                        SIMPLE_SIGNING_DIGEST,
                        &signature.subject_digest,
                    )?;
                    return Ok(VerificationReport {
                        signature_digest: signature.digest.clone(),
                        signer: None,
                        messages: vec![
                            "Signature verified with public key".to_string(),
                            format!("Artifact digest verified: {}", signature.subject_digest),
                        ],
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TrustError::Verification("No public key available for verification".into())
        }))
    }
}
