use crate::keyprovider::{Certificate, KeyProvider, TrustMaterial};
use crate::reference::ArtifactReference;
use crate::stores::{SignatureMetadata, NOTATION_ARTIFACT_TYPE};
use crate::verifiers::{verify_payload_digest, verify_with_public_key, VerificationReport, Verifier};
use crate::{Result, TrustError};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Location of the subject digest in a signed payload.
const TARGET_ARTIFACT_DIGEST: &[&str] = &["targetArtifact", "digest"];

/// Verifier for signatures carrying an X.509 certificate chain that must
/// anchor in the configured trust material.
pub struct CertificateChainVerifier {
    name: String,
    trust: Arc<dyn KeyProvider>,
}

impl CertificateChainVerifier {
    pub fn new(name: impl Into<String>, trust: Arc<dyn KeyProvider>) -> Self {
        Self {
            name: name.into(),
            trust,
        }
    }
}

#[async_trait]
impl Verifier for CertificateChainVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn verifier_type(&self) -> &'static str {
        "notation"
    }

    fn verifiable(&self, signature: &SignatureMetadata) -> bool {
        signature.artifact_type == NOTATION_ARTIFACT_TYPE
    }

    async fn verify(
        &self,
        reference: &ArtifactReference,
        signature: &SignatureMetadata,
    ) -> Result<VerificationReport> {
        debug!("Starting certificate chain verification of {} for {}", signature.digest, reference);

        let chain = signature
            .certificate_chain
            .iter()
            .map(|der| Certificate::from_der(der))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| TrustError::Verification(format!("invalid certificate chain: {}", e)))?;
        let leaf = chain.first().ok_or_else(|| {
            TrustError::Verification("signature carries no certificate chain".into())
        })?;

        verify_chain(&chain, unix_now())?;

        let trust = self.trust.get_certificates().await?;
        verify_anchor(&chain, &trust)?;

        verify_with_public_key(leaf.public_key_der(), &signature.signature, &signature.payload)?;
        verify_payload_digest(&signature.payload, TARGET_ARTIFACT_DIGEST, &signature.subject_digest)?;

        Ok(VerificationReport {
            signature_digest: signature.digest.clone(),
            signer: Some(leaf.subject.clone()),
            messages: vec![
                format!("Certificate chain of {} certificates verified", chain.len()),
                format!("Artifact digest verified: {}", signature.subject_digest),
            ],
        })
    }
}

/// Check validity periods and that each certificate is issued by the next.
fn verify_chain(chain: &[Certificate], now: i64) -> Result<()> {
    for cert in chain {
        if !cert.is_valid_at(now) {
            return Err(TrustError::Verification(format!(
                "certificate '{}' is expired or not yet valid",
                cert.subject
            )));
        }
    }

    for pair in chain.windows(2) {
        if !pair[1].is_ca {
            return Err(TrustError::Verification(format!(
                "certificate '{}' is not a CA and cannot issue '{}'",
                pair[1].subject, pair[0].subject
            )));
        }
        if !pair[0].is_signed_by(&pair[1]) {
            return Err(TrustError::Verification(format!(
                "certificate '{}' is not issued by '{}'",
                pair[0].subject, pair[1].subject
            )));
        }
    }
    Ok(())
}

/// The chain is trusted when one of its certificates is in the trust
/// material or its last certificate was issued by a trusted CA.
fn verify_anchor(chain: &[Certificate], trust: &TrustMaterial) -> Result<()> {
    if chain.iter().any(|cert| trust.contains(cert)) {
        return Ok(());
    }

    if let Some(last) = chain.last() {
        if trust.iter().any(|anchor| anchor.is_ca && last.is_signed_by(anchor)) {
            return Ok(());
        }
    }

    Err(TrustError::Verification(
        "certificate chain does not anchor in the trust material".into(),
    ))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
