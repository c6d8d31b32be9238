use crate::credentials::{Credential, CredentialProvider};
use crate::keyprovider::{SecretBundle, SecretStore};
use crate::{Result, TrustError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::sync::Arc;

const API_VERSION: &str = "7.4";
const USER_AGENT_VALUE: &str = "trust-engine/0.1.0";

/// Key Vault style secrets endpoint:
/// `GET {vault}/secrets/{name}/{version}?api-version=7.4` with a bearer token,
/// answering `{"value": ..., "contentType": ...}`.
pub struct KeyVaultSecretStore {
    client: reqwest::Client,
    vault_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl KeyVaultSecretStore {
    pub fn new(vault_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let vault_url = vault_url.trim().trim_end_matches('/');
        if vault_url.is_empty() {
            return Err(TrustError::Config("vaultURL is required".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            vault_url: vault_url.to_string(),
            credentials,
        })
    }

    fn secret_url(&self, name: &str, version: &str) -> String {
        if version.is_empty() {
            format!("{}/secrets/{}", self.vault_url, name)
        } else {
            format!("{}/secrets/{}/{}", self.vault_url, name, version)
        }
    }

    fn host(&self) -> &str {
        self.vault_url
            .split("://")
            .nth(1)
            .unwrap_or(&self.vault_url)
            .split('/')
            .next()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn get_secret(&self, name: &str, version: &str) -> Result<SecretBundle> {
        let credential = self.credentials.credential(self.host()).await?;
        if matches!(credential, Credential::Basic { .. }) {
            return Err(TrustError::Credential(
                "secret store requires a bearer token credential".into(),
            ));
        }

        let request = self
            .client
            .get(self.secret_url(name, version))
            .query(&[("api-version", API_VERSION)]);
        let response = credential.apply(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(TrustError::KeyProvider(format!(
                    "secret '{}' not found in {}",
                    name, self.vault_url
                )));
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TrustError::KeyProvider(format!(
                "secret store returned {} for '{}': {}",
                status, name, body
            )));
        }

        Ok(response.json().await?)
    }

    fn store_type(&self) -> &'static str {
        "key-vault"
    }
}
