use crate::keyprovider::{parse_certificates_in_pem, CertificateSpec, KeyProvider, TrustMaterial};
use crate::{Result, TrustError};
use async_trait::async_trait;
use std::sync::Arc;

/// Certificates supplied directly in configuration as a PEM chain.
pub struct InlineKeyProvider {
    material: Arc<TrustMaterial>,
}

impl InlineKeyProvider {
    pub fn from_pem(name: &str, pem: &str) -> Result<Self> {
        let spec = CertificateSpec::new(name, "");
        let certificates = parse_certificates_in_pem(pem.as_bytes(), &spec)?;
        if certificates.is_empty() {
            return Err(TrustError::KeyProvider(format!(
                "no certificate chain found for certificate {}",
                spec
            )));
        }
        Ok(Self {
            material: Arc::new(TrustMaterial::new(certificates)),
        })
    }
}

#[async_trait]
impl KeyProvider for InlineKeyProvider {
    async fn get_certificates(&self) -> Result<Arc<TrustMaterial>> {
        Ok(self.material.clone())
    }

    fn provider_type(&self) -> &'static str {
        "inline"
    }
}
