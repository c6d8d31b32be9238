//! Explicit `type name -> constructor` tables for every pluggable family.
//!
//! Nothing registers itself: an engine can only build the store, verifier,
//! policy and key provider types present in the `Registry` it is given.

use crate::config::{PolicyConfig, StoreConfig, VerifierConfig};
use crate::credentials::CredentialConfig;
use crate::keyprovider::{
    CertificateSpec, InlineKeyProvider, KeyProvider, KeyVaultSecretStore, SecretStore,
    SecretStoreKeyProvider,
};
use crate::policy::{AllVerifiersPolicy, PolicyEnforcer, ThresholdPolicy};
use crate::stores::{LocalStore, OciStore, Store};
use crate::verifiers::{CertificateChainVerifier, KeyVerifier, Verifier};
use crate::{Result, TrustError};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds a store from its `parameters`.
pub trait StoreFactory: Send + Sync {
    fn create(&self, parameters: &Value) -> Result<Arc<dyn Store>>;
}

/// Builds a named verifier; may build key providers through the registry.
#[async_trait]
pub trait VerifierFactory: Send + Sync {
    /// Check `parameters` without fetching anything. Runs for every
    /// verifier of an executor before any of them is created.
    fn validate(&self, _name: &str, _parameters: &Value, _registry: &Registry) -> Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        parameters: &Value,
        registry: &Registry,
    ) -> Result<Arc<dyn Verifier>>;
}

/// Builds a policy; `verifier_names` are the executor's verifiers in order.
pub trait PolicyFactory: Send + Sync {
    fn create(&self, parameters: &Value, verifier_names: &[String]) -> Result<Arc<dyn PolicyEnforcer>>;
}

#[async_trait]
pub trait KeyProviderFactory: Send + Sync {
    fn validate(&self, _parameters: &Value, _registry: &Registry) -> Result<()> {
        Ok(())
    }

    async fn create(&self, parameters: &Value, registry: &Registry) -> Result<Arc<dyn KeyProvider>>;
}

/// Reference from a verifier's parameters to a key provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Default)]
pub struct Registry {
    stores: HashMap<String, Arc<dyn StoreFactory>>,
    verifiers: HashMap<String, Arc<dyn VerifierFactory>>,
    policies: HashMap<String, Arc<dyn PolicyFactory>>,
    key_providers: HashMap<String, Arc<dyn KeyProviderFactory>>,
    secret_stores: HashMap<String, Arc<dyn SecretStore>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_store("oras", Arc::new(OciStoreFactory));
        registry.register_store("oci", Arc::new(OciStoreFactory));
        registry.register_store("local", Arc::new(LocalStoreFactory));
        registry.register_verifier("cosign", Arc::new(CosignVerifierFactory));
        registry.register_verifier("notation", Arc::new(NotationVerifierFactory));
        registry.register_policy("threshold", Arc::new(ThresholdPolicyFactory));
        registry.register_policy("all-verifiers", Arc::new(AllVerifiersPolicyFactory));
        registry.register_key_provider("inline", Arc::new(InlineKeyProviderFactory));
        registry.register_key_provider("secret-store", Arc::new(SecretStoreKeyProviderFactory));
        registry.register_key_provider("key-vault", Arc::new(KeyVaultKeyProviderFactory));
        registry
    }

    pub fn register_store(&mut self, store_type: &str, factory: Arc<dyn StoreFactory>) -> &mut Self {
        self.stores.insert(store_type.to_string(), factory);
        self
    }

    pub fn register_verifier(
        &mut self,
        verifier_type: &str,
        factory: Arc<dyn VerifierFactory>,
    ) -> &mut Self {
        self.verifiers.insert(verifier_type.to_string(), factory);
        self
    }

    pub fn register_policy(&mut self, policy_type: &str, factory: Arc<dyn PolicyFactory>) -> &mut Self {
        self.policies.insert(policy_type.to_string(), factory);
        self
    }

    pub fn register_key_provider(
        &mut self,
        provider_type: &str,
        factory: Arc<dyn KeyProviderFactory>,
    ) -> &mut Self {
        self.key_providers.insert(provider_type.to_string(), factory);
        self
    }

    /// Make a secret store client available to `secret-store` key providers
    /// under `name`.
    pub fn register_secret_store(&mut self, name: &str, store: Arc<dyn SecretStore>) -> &mut Self {
        self.secret_stores.insert(name.to_string(), store);
        self
    }

    pub fn secret_store(&self, name: &str) -> Result<Arc<dyn SecretStore>> {
        self.secret_stores
            .get(name)
            .cloned()
            .ok_or_else(|| TrustError::Config(format!("unknown secret store '{}'", name)))
    }

    pub fn create_store(&self, config: &StoreConfig) -> Result<Arc<dyn Store>> {
        let factory = lookup(&self.stores, "store", &config.store_type)?;
        debug!("creating store of type {}", config.store_type);
        factory.create(&config.parameters)
    }

    /// Resolve the verifier's type and check its parameters, including any
    /// key provider they name, without building anything.
    pub fn check_verifier(&self, config: &VerifierConfig) -> Result<()> {
        let factory = lookup(&self.verifiers, "verifier", &config.verifier_type)?;
        factory
            .validate(&config.name, &config.parameters, self)
            .map_err(|e| in_verifier(&config.name, e))
    }

    pub async fn create_verifier(&self, config: &VerifierConfig) -> Result<Arc<dyn Verifier>> {
        let factory = lookup(&self.verifiers, "verifier", &config.verifier_type)?;
        debug!("creating verifier {} of type {}", config.name, config.verifier_type);
        factory
            .create(&config.name, &config.parameters, self)
            .await
            .map_err(|e| in_verifier(&config.name, e))
    }

    /// `None` selects the all-verifiers policy.
    pub fn create_policy(
        &self,
        config: Option<&PolicyConfig>,
        verifier_names: &[String],
    ) -> Result<Arc<dyn PolicyEnforcer>> {
        match config {
            None => Ok(Arc::new(AllVerifiersPolicy)),
            Some(config) => {
                let factory = lookup(&self.policies, "policy", &config.policy_type)?;
                factory.create(&config.parameters, verifier_names)
            }
        }
    }

    pub fn check_key_provider(&self, config: &KeyProviderConfig) -> Result<()> {
        lookup(&self.key_providers, "key provider", &config.provider_type)?
            .validate(&config.parameters, self)
    }

    pub async fn create_key_provider(&self, config: &KeyProviderConfig) -> Result<Arc<dyn KeyProvider>> {
        let factory = lookup(&self.key_providers, "key provider", &config.provider_type)?;
        debug!("creating key provider of type {}", config.provider_type);
        factory.create(&config.parameters, self).await
    }
}

fn in_verifier(name: &str, error: TrustError) -> TrustError {
    match error {
        TrustError::Config(message) => TrustError::Config(format!("verifier '{}': {}", name, message)),
        other => other,
    }
}

fn lookup<'a, F: ?Sized>(
    table: &'a HashMap<String, Arc<F>>,
    family: &str,
    type_name: &str,
) -> Result<&'a Arc<F>> {
    table.get(type_name).ok_or_else(|| {
        let mut known: Vec<&str> = table.keys().map(String::as_str).collect();
        known.sort_unstable();
        TrustError::Config(format!(
            "unknown {} type '{}' (registered: {})",
            family,
            type_name,
            known.join(", ")
        ))
    })
}

/// Deserialize plugin parameters; absent parameters read as `{}`.
fn parameters<T: DeserializeOwned>(family: &str, value: &Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| TrustError::Config(format!("invalid {} parameters: {}", family, e)))
}

// Stores

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciStoreParameters {
    #[serde(default)]
    credential: CredentialConfig,
    #[serde(default)]
    plain_http: bool,
}

struct OciStoreFactory;

impl StoreFactory for OciStoreFactory {
    fn create(&self, value: &Value) -> Result<Arc<dyn Store>> {
        let params: OciStoreParameters = parameters("oras store", value)?;
        let credentials = params.credential.build()?;
        Ok(Arc::new(OciStore::new(credentials, params.plain_http)?))
    }
}

#[derive(Deserialize)]
struct LocalStoreParameters {
    path: PathBuf,
}

struct LocalStoreFactory;

impl StoreFactory for LocalStoreFactory {
    fn create(&self, value: &Value) -> Result<Arc<dyn Store>> {
        let params: LocalStoreParameters = parameters("local store", value)?;
        Ok(Arc::new(LocalStore::new(params.path)))
    }
}

// Verifiers

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CosignParameters {
    key_provider: Option<KeyProviderConfig>,
    #[serde(default)]
    public_keys: Vec<String>,
}

enum CosignKeys {
    Provider(KeyProviderConfig),
    Public(Vec<String>),
}

impl CosignParameters {
    fn keys(self) -> Result<CosignKeys> {
        match (self.key_provider, self.public_keys.is_empty()) {
            (Some(provider), true) => Ok(CosignKeys::Provider(provider)),
            (None, false) => Ok(CosignKeys::Public(self.public_keys)),
            (Some(_), false) => Err(TrustError::Config(
                "keyProvider and publicKeys are mutually exclusive".into(),
            )),
            (None, true) => Err(TrustError::Config(
                "either keyProvider or publicKeys is required".into(),
            )),
        }
    }
}

struct CosignVerifierFactory;

#[async_trait]
impl VerifierFactory for CosignVerifierFactory {
    fn validate(&self, name: &str, value: &Value, registry: &Registry) -> Result<()> {
        let params: CosignParameters = parameters("cosign verifier", value)?;
        match params.keys()? {
            CosignKeys::Provider(provider) => registry.check_key_provider(&provider),
            CosignKeys::Public(keys) => KeyVerifier::with_public_keys(name, &keys).map(|_| ()),
        }
    }

    async fn create(&self, name: &str, value: &Value, registry: &Registry) -> Result<Arc<dyn Verifier>> {
        let params: CosignParameters = parameters("cosign verifier", value)?;
        match params.keys()? {
            CosignKeys::Provider(provider) => {
                let provider = registry.create_key_provider(&provider).await?;
                Ok(Arc::new(KeyVerifier::with_key_provider(name, provider)))
            }
            CosignKeys::Public(keys) => Ok(Arc::new(KeyVerifier::with_public_keys(name, &keys)?)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotationParameters {
    key_provider: KeyProviderConfig,
}

struct NotationVerifierFactory;

#[async_trait]
impl VerifierFactory for NotationVerifierFactory {
    fn validate(&self, _name: &str, value: &Value, registry: &Registry) -> Result<()> {
        let params: NotationParameters = parameters("notation verifier", value)?;
        registry.check_key_provider(&params.key_provider)
    }

    async fn create(&self, name: &str, value: &Value, registry: &Registry) -> Result<Arc<dyn Verifier>> {
        let params: NotationParameters = parameters("notation verifier", value)?;
        let trust = registry.create_key_provider(&params.key_provider).await?;
        Ok(Arc::new(CertificateChainVerifier::new(name, trust)))
    }
}

// Policies

#[derive(Deserialize)]
struct ThresholdParameters {
    threshold: Option<usize>,
    #[serde(default)]
    verifiers: Vec<String>,
}

struct ThresholdPolicyFactory;

impl PolicyFactory for ThresholdPolicyFactory {
    fn create(&self, value: &Value, verifier_names: &[String]) -> Result<Arc<dyn PolicyEnforcer>> {
        let params: ThresholdParameters = parameters("threshold policy", value)?;
        Ok(Arc::new(ThresholdPolicy::new(
            params.threshold,
            params.verifiers,
            verifier_names,
        )?))
    }
}

struct AllVerifiersPolicyFactory;

impl PolicyFactory for AllVerifiersPolicyFactory {
    fn create(&self, _value: &Value, _verifier_names: &[String]) -> Result<Arc<dyn PolicyEnforcer>> {
        Ok(Arc::new(AllVerifiersPolicy))
    }
}

// Key providers

#[derive(Deserialize)]
struct InlineParameters {
    pem: String,
}

struct InlineKeyProviderFactory;

#[async_trait]
impl KeyProviderFactory for InlineKeyProviderFactory {
    fn validate(&self, value: &Value, _registry: &Registry) -> Result<()> {
        parameters::<InlineParameters>("inline key provider", value).map(|_| ())
    }

    async fn create(&self, value: &Value, _registry: &Registry) -> Result<Arc<dyn KeyProvider>> {
        let params: InlineParameters = parameters("inline key provider", value)?;
        Ok(Arc::new(InlineKeyProvider::from_pem("inline", &params.pem)?))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretStoreParameters {
    store: String,
    #[serde(default)]
    certificates: Vec<CertificateSpec>,
    #[serde(default)]
    refresh_seconds: u64,
}

struct SecretStoreKeyProviderFactory;

#[async_trait]
impl KeyProviderFactory for SecretStoreKeyProviderFactory {
    fn validate(&self, value: &Value, registry: &Registry) -> Result<()> {
        let params: SecretStoreParameters = parameters("secret-store key provider", value)?;
        registry.secret_store(&params.store)?;
        check_certificate_specs(&params.certificates)
    }

    async fn create(&self, value: &Value, registry: &Registry) -> Result<Arc<dyn KeyProvider>> {
        let params: SecretStoreParameters = parameters("secret-store key provider", value)?;
        let store = registry.secret_store(&params.store)?;
        secret_store_provider(store, params.certificates, params.refresh_seconds).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyVaultParameters {
    #[serde(rename = "vaultURL", default)]
    vault_url: String,
    #[serde(default)]
    credential: CredentialConfig,
    #[serde(default)]
    certificates: Vec<CertificateSpec>,
    #[serde(default)]
    refresh_seconds: u64,
}

struct KeyVaultKeyProviderFactory;

#[async_trait]
impl KeyProviderFactory for KeyVaultKeyProviderFactory {
    fn validate(&self, value: &Value, _registry: &Registry) -> Result<()> {
        let params: KeyVaultParameters = parameters("key-vault key provider", value)?;
        KeyVaultSecretStore::new(&params.vault_url, params.credential.build()?)?;
        check_certificate_specs(&params.certificates)
    }

    async fn create(&self, value: &Value, _registry: &Registry) -> Result<Arc<dyn KeyProvider>> {
        let params: KeyVaultParameters = parameters("key-vault key provider", value)?;
        let store = KeyVaultSecretStore::new(&params.vault_url, params.credential.build()?)?;
        secret_store_provider(Arc::new(store), params.certificates, params.refresh_seconds).await
    }
}

fn check_certificate_specs(certificates: &[CertificateSpec]) -> Result<()> {
    if certificates.is_empty() {
        return Err(TrustError::Config(
            "at least one certificate must be specified".into(),
        ));
    }
    Ok(())
}

async fn secret_store_provider(
    store: Arc<dyn SecretStore>,
    certificates: Vec<CertificateSpec>,
    refresh_seconds: u64,
) -> Result<Arc<dyn KeyProvider>> {
    let provider = Arc::new(SecretStoreKeyProvider::new(store, certificates).await?);
    if refresh_seconds > 0 {
        provider.spawn_refresh(Duration::from_secs(refresh_seconds));
    }
    Ok(provider)
}
