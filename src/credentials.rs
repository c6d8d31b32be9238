use crate::{Result, TrustError};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Credential presented to a registry or secret store.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

// Secrets must never reach the logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::Basic { username, .. } => {
                write!(f, "Basic {{ username: {:?}, password: <redacted> }}", username)
            }
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

impl Credential {
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Anonymous => request,
            Credential::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credential::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// Source of credentials, resolved per request so rotated secrets are picked
/// up without rebuilding the store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, host: &str) -> Result<Credential>;

    fn provider_type(&self) -> &'static str;
}

pub struct AnonymousCredentialProvider;

#[async_trait]
impl CredentialProvider for AnonymousCredentialProvider {
    async fn credential(&self, _host: &str) -> Result<Credential> {
        Ok(Credential::Anonymous)
    }

    fn provider_type(&self) -> &'static str {
        "anonymous"
    }
}

/// Fixed username and password.
pub struct StaticCredentialProvider {
    username: String,
    password: String,
}

impl StaticCredentialProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credential(&self, _host: &str) -> Result<Credential> {
        Ok(Credential::Basic {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    fn provider_type(&self) -> &'static str {
        "static"
    }
}

/// Bearer token read from a file on every request, as projected workload
/// identity tokens are rotated in place.
pub struct TokenFileCredentialProvider {
    token_path: PathBuf,
}

impl TokenFileCredentialProvider {
    pub fn new(token_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for TokenFileCredentialProvider {
    async fn credential(&self, _host: &str) -> Result<Credential> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| {
                TrustError::Credential(format!(
                    "failed to read token file {}: {}",
                    self.token_path.display(),
                    e
                ))
            })?;

        let token = token.trim();
        if token.is_empty() {
            return Err(TrustError::Credential(format!(
                "token file {} is empty",
                self.token_path.display()
            )));
        }
        Ok(Credential::Bearer(token.to_string()))
    }

    fn provider_type(&self) -> &'static str {
        "token-file"
    }
}

/// Credential settings as they appear in store and secret store parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "provider")]
pub enum CredentialConfig {
    #[default]
    #[serde(rename = "anonymous")]
    Anonymous,
    #[serde(rename = "static")]
    Static { username: String, password: String },
    #[serde(rename = "token-file", rename_all = "camelCase")]
    TokenFile { token_path: PathBuf },
}

impl CredentialConfig {
    pub fn build(&self) -> Result<std::sync::Arc<dyn CredentialProvider>> {
        use std::sync::Arc;

        match self {
            CredentialConfig::Anonymous => Ok(Arc::new(AnonymousCredentialProvider)),
            CredentialConfig::Static { username, password } => {
                if username.is_empty() {
                    return Err(TrustError::Config(
                        "static credential requires a username".into(),
                    ));
                }
                Ok(Arc::new(StaticCredentialProvider::new(username, password)))
            }
            CredentialConfig::TokenFile { token_path } => {
                Ok(Arc::new(TokenFileCredentialProvider::new(token_path)))
            }
        }
    }
}
