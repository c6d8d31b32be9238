pub mod cosign;
pub mod notation;

use crate::decision::VerifierOutcome;
use crate::reference::ArtifactReference;
use crate::stores::SignatureMetadata;
use crate::{Result, TrustError};
use async_trait::async_trait;
use log::debug;

// Import cryptographic libraries for signature verification
use ed25519_dalek::{Signature as Ed25519Signature, Verifier as _, VerifyingKey as Ed25519VerifyingKey};
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use p384::ecdsa::{Signature as P384Signature, VerifyingKey as P384VerifyingKey};

pub use cosign::KeyVerifier;
pub use notation::CertificateChainVerifier;

/// Successful verification of one signature object.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Digest of the signature object that verified
    pub signature_digest: String,
    /// Identity the signature was anchored to, if any
    pub signer: Option<String>,
    /// Any warnings or notes
    pub messages: Vec<String>,
}

/// One verification scheme, configured under a unique name.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    /// Get the verifier type name for logging
    fn verifier_type(&self) -> &'static str;

    /// Whether this verifier understands `signature`.
    fn verifiable(&self, signature: &SignatureMetadata) -> bool;

    /// Verify a single signature object against the artifact.
    async fn verify(
        &self,
        reference: &ArtifactReference,
        signature: &SignatureMetadata,
    ) -> Result<VerificationReport>;
}

/// Run `verifier` over every signature it understands. The verifier passes
/// as soon as one signature verifies; errors become a failing outcome.
pub async fn run_verifier(
    verifier: &dyn Verifier,
    reference: &ArtifactReference,
    signatures: &[SignatureMetadata],
) -> VerifierOutcome {
    let name = verifier.name();
    let verifier_type = verifier.verifier_type();
    let mut failures = Vec::new();

    for signature in signatures.iter().filter(|s| verifier.verifiable(s)) {
        match verifier.verify(reference, signature).await {
            Ok(report) => {
                debug!(
                    "verifier {} accepted signature {} for {}",
                    name, report.signature_digest, reference
                );
                let mut detail = format!("signature {} verified", report.signature_digest);
                if let Some(signer) = &report.signer {
                    detail.push_str(&format!(" (signer: {})", signer));
                }
                return VerifierOutcome::passed(name, verifier_type, detail);
            }
            Err(e) => {
                debug!("verifier {} rejected signature {}: {}", name, signature.digest, e);
                failures.push(format!("{}: {}", signature.digest, e));
            }
        }
    }

    if failures.is_empty() {
        return VerifierOutcome::failed(
            name,
            verifier_type,
            format!("no {} signatures found for {}", verifier_type, reference),
        );
    }
    VerifierOutcome::failed(name, verifier_type, failures.join("; "))
}

/// Verify `signature` over `message` with a DER encoded SubjectPublicKeyInfo.
/// P-256, P-384 and Ed25519 keys are supported.
pub fn verify_with_public_key(public_key: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    if let Ok(verifying_key) = P256VerifyingKey::from_public_key_der(public_key) {
        debug!("Attempting P-256 ECDSA verification");
        let sig = P256Signature::from_der(signature)
            .or_else(|_| P256Signature::from_slice(signature))
            .map_err(|e| TrustError::Verification(format!("Failed to parse P-256 signature: {}", e)))?;
        return verifying_key
            .verify(message, &sig)
            .map_err(|e| TrustError::Verification(format!("P-256 verification failed: {}", e)));
    }

    if let Ok(verifying_key) = P384VerifyingKey::from_public_key_der(public_key) {
        debug!("Attempting P-384 ECDSA verification");
        let sig = P384Signature::from_der(signature)
            .or_else(|_| P384Signature::from_slice(signature))
            .map_err(|e| TrustError::Verification(format!("Failed to parse P-384 signature: {}", e)))?;
        return verifying_key
            .verify(message, &sig)
            .map_err(|e| TrustError::Verification(format!("P-384 verification failed: {}", e)));
    }

    if let Ok(verifying_key) = Ed25519VerifyingKey::from_public_key_der(public_key) {
        debug!("Attempting Ed25519 verification");
        let sig = Ed25519Signature::from_slice(signature).map_err(|e| {
            TrustError::Verification(format!("Invalid Ed25519 signature: {}", e))
        })?;
        return verifying_key
            .verify(message, &sig)
            .map_err(|e| TrustError::Verification(format!("Ed25519 verification failed: {}", e)));
    }

    Err(TrustError::Verification(
        "Unsupported public key type".into(),
    ))
}

/// Decode a PEM `PUBLIC KEY` block into SubjectPublicKeyInfo DER.
pub fn public_key_from_pem(pem_key: &str) -> Result<Vec<u8>> {
    let block = pem::parse(pem_key.trim())
        .map_err(|e| TrustError::Config(format!("Invalid PEM public key: {}", e)))?;
    if block.tag() != "PUBLIC KEY" {
        return Err(TrustError::Config(format!(
            "expected a PUBLIC KEY block, found {}",
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

/// Read a string field at `path` in a JSON payload.
pub(crate) fn payload_field<'a>(payload: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(payload, |value, key| value.get(*key))
        .and_then(|value| value.as_str())
}

/// Check that a signed payload names `subject_digest` at `path`.
pub(crate) fn verify_payload_digest(payload: &[u8], path: &[&str], subject_digest: &str) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| TrustError::Verification(format!("Failed to parse payload JSON: {}", e)))?;

    match payload_field(&payload, path) {
        Some(digest) if digest == subject_digest => Ok(()),
        Some(digest) => Err(TrustError::Verification(format!(
            "Artifact digest mismatch: expected {}, signed {}",
            subject_digest, digest
        ))),
        None => Err(TrustError::Verification(format!(
            "payload does not name a subject digest at {}",
            path.join(".")
        ))),
    }
}
