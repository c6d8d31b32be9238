use crate::keyprovider::{certificates_from_secret, CertificateSpec, KeyProvider, TrustMaterial};
use crate::{Result, TrustError};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One secret as returned by a secret store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBundle {
    pub value: String,
    #[serde(default)]
    pub content_type: String,
}

/// Remote secret store holding certificate material.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch secret `name`; an empty `version` selects the latest version.
    async fn get_secret(&self, name: &str, version: &str) -> Result<SecretBundle>;

    fn store_type(&self) -> &'static str;
}

/// Key provider backed by a secret store.
///
/// Readers load an immutable snapshot; refreshes build a complete new
/// snapshot and swap it in, so a reader never observes a partial update.
pub struct SecretStoreKeyProvider {
    store: Arc<dyn SecretStore>,
    specs: Vec<CertificateSpec>,
    snapshot: ArcSwap<TrustMaterial>,
}

impl SecretStoreKeyProvider {
    /// Validate `specs` and fetch every certificate before returning.
    pub async fn new(store: Arc<dyn SecretStore>, specs: Vec<CertificateSpec>) -> Result<Self> {
        let provider = Self::uninitialized(store, specs)?;
        let material = provider.fetch_all().await.map_err(|e| {
            TrustError::KeyProvider(format!(
                "failed to fetch certificates during initialization: {}",
                e
            ))
        })?;
        provider.snapshot.store(Arc::new(material));
        Ok(provider)
    }

    /// Build the provider without fetching. `get_certificates` fails until
    /// the first successful `refresh`.
    pub fn uninitialized(store: Arc<dyn SecretStore>, specs: Vec<CertificateSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(TrustError::Config(
                "at least one certificate must be specified".into(),
            ));
        }
        Ok(Self {
            store,
            specs,
            snapshot: ArcSwap::from_pointee(TrustMaterial::default()),
        })
    }

    pub fn specs(&self) -> &[CertificateSpec] {
        &self.specs
    }

    /// Refetch all certificates. On failure the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<()> {
        let material = self.fetch_all().await?;
        info!(
            "refreshed {} certificates from {} secret store",
            material.len(),
            self.store.store_type()
        );
        self.snapshot.store(Arc::new(material));
        Ok(())
    }

    /// Refresh periodically until the provider is dropped.
    pub fn spawn_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let provider: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately and the provider was
            // just populated.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(provider) = provider.upgrade() else {
                    debug!("key provider dropped, stopping certificate refresh");
                    return;
                };
                if let Err(e) = provider.refresh().await {
                    warn!("certificate refresh failed, keeping previous snapshot: {}", e);
                }
            }
        })
    }

    async fn fetch_all(&self) -> Result<TrustMaterial> {
        let mut certificates = Vec::new();
        for spec in &self.specs {
            if spec.name.trim().is_empty() {
                return Err(TrustError::KeyProvider(
                    "certificate name must not be empty".into(),
                ));
            }
            let secret = self.store.get_secret(&spec.name, &spec.version).await?;
            let chain = certificates_from_secret(&secret, spec)?;
            debug!("loaded {} certificates for {}", chain.len(), spec);
            certificates.extend(chain);
        }
        Ok(TrustMaterial::new(certificates))
    }
}

#[async_trait]
impl KeyProvider for SecretStoreKeyProvider {
    async fn get_certificates(&self) -> Result<Arc<TrustMaterial>> {
        let snapshot = self.snapshot.load_full();
        if snapshot.is_empty() {
            return Err(TrustError::KeyProvider(
                "no cached certificates available".into(),
            ));
        }
        Ok(snapshot)
    }

    fn provider_type(&self) -> &'static str {
        "secret-store"
    }
}
