pub mod inline;
pub mod keyvault;
pub mod secret_store;

use crate::{Result, TrustError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::*;

pub use inline::InlineKeyProvider;
pub use keyvault::KeyVaultSecretStore;
pub use secret_store::{SecretBundle, SecretStore, SecretStoreKeyProvider};

pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
pub const PKCS12_CONTENT_TYPE: &str = "application/x-pkcs12";

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Names one certificate object in a secret store. An empty version selects
/// the latest one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateSpec {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl CertificateSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for CertificateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{} (latest)", self.name)
        } else {
            write!(f, "{} (version {})", self.name, self.version)
        }
    }
}

/// Parsed X.509 certificate that owns its DER encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, cert) = X509Certificate::from_der(der).map_err(|e| {
            TrustError::KeyProvider(format!("failed to parse certificate: {}", e))
        })?;
        if !rest.is_empty() {
            return Err(TrustError::KeyProvider(format!(
                "certificate has {} bytes of trailing data",
                rest.len()
            )));
        }

        Ok(Self {
            der: der.to_vec(),
            public_key: cert.public_key().raw.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca: cert.is_ca(),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key
    }

    pub fn is_valid_at(&self, unix_seconds: i64) -> bool {
        self.not_before <= unix_seconds && unix_seconds <= self.not_after
    }

    /// Whether this certificate's signature was produced by `issuer`'s key.
    pub fn is_signed_by(&self, issuer: &Certificate) -> bool {
        let Ok((_, subject)) = X509Certificate::from_der(&self.der) else {
            return false;
        };
        let Ok((_, issuer)) = X509Certificate::from_der(&issuer.der) else {
            return false;
        };
        subject.verify_signature(Some(issuer.public_key())).is_ok()
    }
}

/// Ordered certificate set a verifier anchors trust in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustMaterial {
    certificates: Vec<Certificate>,
}

impl TrustMaterial {
    pub fn new(certificates: Vec<Certificate>) -> Self {
        Self { certificates }
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn contains(&self, certificate: &Certificate) -> bool {
        self.certificates.iter().any(|c| c.der == certificate.der)
    }
}

/// Supplies the trust material a verifier checks signatures against.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Latest cached certificate snapshot. Fails rather than returning an
    /// empty set.
    async fn get_certificates(&self) -> Result<Arc<TrustMaterial>>;

    fn provider_type(&self) -> &'static str;
}

/// Parse every CERTIFICATE block of a PEM stream, in input order.
///
/// Other block types (keys, requests, revocation lists) are skipped. A
/// CERTIFICATE block that does not decode aborts the whole parse. Input
/// without certificates yields an empty list, not an error.
pub fn parse_certificates_in_pem(data: &[u8], spec: &CertificateSpec) -> Result<Vec<Certificate>> {
    let text = String::from_utf8_lossy(data);
    let mut certificates = Vec::new();

    for block in pem_blocks(&text) {
        if block.label != CERTIFICATE_LABEL {
            trace!("skipping PEM block of type {} in {}", block.label, spec);
            continue;
        }

        let decoded = ::pem::parse(block.text).map_err(|e| {
            TrustError::KeyProvider(format!(
                "failed to decode PEM block for certificate {}: {}",
                spec, e
            ))
        })?;
        let certificate = Certificate::from_der(decoded.contents()).map_err(|e| {
            TrustError::KeyProvider(format!("certificate {}: {}", spec, e))
        })?;
        certificates.push(certificate);
    }

    Ok(certificates)
}

/// Parse a base64 encoded PKCS#12 bundle. Any failure is fatal.
pub fn parse_certificates_in_pkcs12(
    data: Option<&str>,
    spec: &CertificateSpec,
) -> Result<Vec<Certificate>> {
    // Secret stores may hand back line-wrapped base64.
    let data: String = data.unwrap_or_default().split_ascii_whitespace().collect();
    if data.is_empty() {
        return Err(TrustError::KeyProvider(format!(
            "certificate {}: PKCS#12 data is empty",
            spec
        )));
    }

    let der = BASE64.decode(&data).map_err(|e| {
        TrustError::KeyProvider(format!(
            "certificate {}: failed to decode PKCS#12 base64: {}",
            spec, e
        ))
    })?;

    let pfx = p12::PFX::parse(&der).map_err(|e| {
        TrustError::KeyProvider(format!(
            "certificate {}: failed to parse PKCS#12 bundle: {:?}",
            spec, e
        ))
    })?;
    let bags = pfx.cert_x509_bags("").map_err(|e| {
        TrustError::KeyProvider(format!(
            "certificate {}: failed to read PKCS#12 certificates: {:?}",
            spec, e
        ))
    })?;

    if bags.is_empty() {
        return Err(TrustError::KeyProvider(format!(
            "certificate {}: PKCS#12 bundle contains no certificates",
            spec
        )));
    }

    bags.iter()
        .map(|der| {
            Certificate::from_der(der)
                .map_err(|e| TrustError::KeyProvider(format!("certificate {}: {}", spec, e)))
        })
        .collect()
}

/// Decode one named secret into its certificate chain, enforcing that the
/// chain is non-empty.
pub fn certificates_from_secret(
    secret: &SecretBundle,
    spec: &CertificateSpec,
) -> Result<Vec<Certificate>> {
    let certificates = match secret.content_type.as_str() {
        PEM_CONTENT_TYPE => parse_certificates_in_pem(secret.value.as_bytes(), spec)?,
        PKCS12_CONTENT_TYPE => parse_certificates_in_pkcs12(Some(&secret.value), spec)?,
        other => {
            return Err(TrustError::KeyProvider(format!(
                "certificate {}: unexpected content type '{}', expected {} or {}",
                spec, other, PEM_CONTENT_TYPE, PKCS12_CONTENT_TYPE
            )))
        }
    };

    if certificates.is_empty() {
        return Err(TrustError::KeyProvider(format!(
            "no certificate chain found for certificate {}",
            spec
        )));
    }
    Ok(certificates)
}

struct PemBlock<'a> {
    label: &'a str,
    text: &'a str,
}

/// Split `text` into framed PEM blocks without decoding them. An opening
/// boundary with no matching end terminates the scan.
fn pem_blocks(text: &str) -> Vec<PemBlock<'_>> {
    const BEGIN: &str = "-----BEGIN ";
    const DASHES: &str = "-----";

    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(BEGIN) {
        let start = cursor + offset;
        let label_start = start + BEGIN.len();
        let Some(label_len) = text[label_start..].find(DASHES) else {
            break;
        };
        let label = &text[label_start..label_start + label_len];
        if label.contains('\n') {
            cursor = label_start;
            continue;
        }

        let end_marker = format!("-----END {}-----", label);
        let Some(end_offset) = text[label_start..].find(&end_marker) else {
            break;
        };
        let end = label_start + end_offset + end_marker.len();

        blocks.push(PemBlock {
            label,
            text: &text[start..end],
        });
        cursor = end;
    }

    blocks
}
