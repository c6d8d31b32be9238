#![allow(dead_code)]

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use std::path::Path;
use trust_engine::sha256_digest;
use trust_engine::stores::{SignatureEnvelope, COSIGN_ARTIFACT_TYPE, NOTATION_ARTIFACT_TYPE};

pub const ROOT_PEM: &str = include_str!("../data/root.pem");
pub const LEAF_PEM: &str = include_str!("../data/leaf.pem");
pub const LEAF_KEY: &str = include_str!("../data/leaf.key");
pub const OTHER_ROOT_PEM: &str = include_str!("../data/other_root.pem");

/// Digest of the artifact every fixture signs.
pub fn subject_digest() -> String {
    sha256_digest(b"{\"schemaVersion\":2}")
}

pub fn cosign_key() -> SigningKey {
    SigningKey::from_slice(&[0x11; 32]).unwrap()
}

pub fn leaf_key() -> SigningKey {
    SigningKey::from_pkcs8_pem(LEAF_KEY).unwrap()
}

pub fn public_key_pem(key: &SigningKey) -> String {
    key.verifying_key().to_public_key_pem(LineEnding::LF).unwrap()
}

pub fn der(pem_text: &str) -> Vec<u8> {
    pem::parse(pem_text).unwrap().contents().to_vec()
}

pub fn sign(key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(payload);
    signature.to_der().as_bytes().to_vec()
}

pub fn cosign_payload(digest: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "critical": {
            "identity": {"docker-reference": "registry.example.io/app"},
            "image": {"docker-manifest-digest": digest},
            "type": "cosign container image signature"
        },
        "optional": null
    }))
    .unwrap()
}

pub fn notation_payload(digest: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "targetArtifact": {
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": digest,
            "size": 19
        }
    }))
    .unwrap()
}

pub fn cosign_envelope(key: &SigningKey, digest: &str) -> SignatureEnvelope {
    let payload = cosign_payload(digest);
    SignatureEnvelope::new(COSIGN_ARTIFACT_TYPE, &payload, &sign(key, &payload))
}

/// Envelope signed by the leaf key, carrying `chain` (PEM, leaf first).
pub fn notation_envelope(digest: &str, chain: &[&str]) -> SignatureEnvelope {
    let payload = notation_payload(digest);
    let chain: Vec<Vec<u8>> = chain.iter().map(|pem_text| der(pem_text)).collect();
    SignatureEnvelope::new(NOTATION_ARTIFACT_TYPE, &payload, &sign(&leaf_key(), &payload))
        .with_certificate_chain(&chain)
}

/// Store `envelope` where a `LocalStore` rooted at `root` finds it.
pub async fn write_envelope(root: &Path, digest: &str, file_name: &str, envelope: &SignatureEnvelope) {
    let dir = root.join(digest.replace(':', "-"));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(file_name), serde_json::to_vec(envelope).unwrap())
        .await
        .unwrap();
}
