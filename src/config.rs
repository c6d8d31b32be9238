use crate::scope::Scope;
use crate::{Result, TrustError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_CACHE_TTL_SECONDS: i64 = 600;
pub const DEFAULT_CACHE_MAX_ENTRIES: i64 = 10_000;

/// Top level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub executors: Vec<ExecutorConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// One scoped verification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub verifiers: Vec<VerifierConfig>,
    /// When omitted every verifier must pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_enforcer: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub store_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub verifier_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(rename = "type", default)]
    pub policy_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    #[serde(default = "default_max_entries")]
    pub max_entries: i64,
}

fn default_ttl_seconds() -> i64 {
    DEFAULT_CACHE_TTL_SECONDS
}

fn default_max_entries() -> i64 {
    DEFAULT_CACHE_MAX_ENTRIES
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| TrustError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            TrustError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executors.is_empty() {
            return Err(TrustError::Config("at least one executor must be configured".into()));
        }
        if self.cache.ttl_seconds < 0 {
            return Err(TrustError::Config(format!(
                "cache ttlSeconds must not be negative, got {}",
                self.cache.ttl_seconds
            )));
        }
        if self.cache.max_entries <= 0 {
            return Err(TrustError::Config(format!(
                "cache maxEntries must be positive, got {}",
                self.cache.max_entries
            )));
        }

        let mut scopes = Vec::with_capacity(self.executors.len());
        for (index, executor) in self.executors.iter().enumerate() {
            executor
                .validate()
                .map_err(|e| TrustError::Config(format!("executor {}: {}", index, strip(e))))?;
            scopes.push(executor.parsed_scopes()?);
        }

        check_scope_overlap(&scopes)
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            return Err(TrustError::Config("scopes must contain at least one entry".into()));
        }
        self.parsed_scopes()?;

        if self.stores.is_empty() {
            return Err(TrustError::Config("at least one store must be configured".into()));
        }
        if let Some(index) = self.stores.iter().position(|s| s.store_type.trim().is_empty()) {
            return Err(TrustError::Config(format!("store {} has no type", index)));
        }

        if self.verifiers.is_empty() {
            return Err(TrustError::Config("at least one verifier must be configured".into()));
        }
        let mut names = HashSet::new();
        for verifier in &self.verifiers {
            if verifier.name.trim().is_empty() {
                return Err(TrustError::Config("verifier name must not be empty".into()));
            }
            if verifier.verifier_type.trim().is_empty() {
                return Err(TrustError::Config(format!(
                    "verifier '{}' has no type",
                    verifier.name
                )));
            }
            if !names.insert(verifier.name.as_str()) {
                return Err(TrustError::Config(format!(
                    "verifier name '{}' is not unique",
                    verifier.name
                )));
            }
        }

        if let Some(policy) = &self.policy_enforcer {
            if policy.policy_type.trim().is_empty() {
                return Err(TrustError::Config("policyEnforcer has no type".into()));
            }
        }
        Ok(())
    }

    pub fn parsed_scopes(&self) -> Result<Vec<Scope>> {
        let mut seen = HashSet::new();
        self.scopes
            .iter()
            .map(|pattern| {
                let scope = Scope::parse(pattern)?;
                if !seen.insert(scope.as_str().to_string()) {
                    return Err(TrustError::Config(format!(
                        "scope '{}' is listed twice",
                        scope
                    )));
                }
                Ok(scope)
            })
            .collect()
    }

    pub fn verifier_names(&self) -> Vec<String> {
        self.verifiers.iter().map(|v| v.name.clone()).collect()
    }
}

/// Reject scope sets where one reference could route to two executors
/// with no single most specific match. Overlapping scopes of different
/// executors are allowed only when their specificity differs.
pub fn check_scope_overlap(executors: &[Vec<Scope>]) -> Result<()> {
    for (i, scopes) in executors.iter().enumerate() {
        for (j, others) in executors.iter().enumerate().skip(i + 1) {
            for scope in scopes {
                for other in others {
                    if scope.specificity() == other.specificity() && scope.overlaps(other) {
                        return Err(TrustError::Config(format!(
                            "scope '{}' of executor {} and scope '{}' of executor {} match the same references with equal specificity",
                            scope, i, other, j
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn strip(error: TrustError) -> String {
    match error {
        TrustError::Config(message) => message,
        other => other.to_string(),
    }
}
