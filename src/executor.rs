use crate::config::ExecutorConfig;
use crate::decision::{truncate_brief, TrustDecision, VerifierOutcome};
use crate::policy::PolicyEnforcer;
use crate::reference::ArtifactReference;
use crate::registry::Registry;
use crate::scope::Scope;
use crate::stores::{SignatureMetadata, Store};
use crate::verifiers::{run_verifier, Verifier};
use crate::{sha256_digest, Result, TrustError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Initialization status of one executor, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStatus {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief_error: String,
}

impl ExecutorStatus {
    fn ready() -> Self {
        Self {
            succeeded: true,
            error: String::new(),
            brief_error: String::new(),
        }
    }

    fn failed(error: &TrustError) -> Self {
        let error = error.to_string();
        Self {
            succeeded: false,
            brief_error: truncate_brief(&error),
            error,
        }
    }
}

struct Components {
    stores: Vec<Arc<dyn Store>>,
    verifiers: Vec<Arc<dyn Verifier>>,
    policy: Arc<dyn PolicyEnforcer>,
}

/// Scoped unit of verification: stores, verifiers and a policy.
///
/// An executor whose components failed to build stays `Failed` for its
/// whole lifetime and refuses to evaluate.
pub struct Executor {
    scopes: Vec<Scope>,
    identity: String,
    verifier_set_identity: String,
    components: Option<Components>,
    status: ExecutorStatus,
}

impl Executor {
    /// Assemble a ready executor from already built components.
    pub fn new(
        scopes: Vec<Scope>,
        stores: Vec<Arc<dyn Store>>,
        verifiers: Vec<Arc<dyn Verifier>>,
        policy: Arc<dyn PolicyEnforcer>,
    ) -> Result<Self> {
        if scopes.is_empty() {
            return Err(TrustError::Config("scopes must contain at least one entry".into()));
        }
        if stores.is_empty() {
            return Err(TrustError::Config("at least one store must be configured".into()));
        }
        if verifiers.is_empty() {
            return Err(TrustError::Config("at least one verifier must be configured".into()));
        }
        let mut names = HashSet::new();
        if let Some(duplicate) = verifiers.iter().find(|v| !names.insert(v.name().to_string())) {
            return Err(TrustError::Config(format!(
                "verifier name '{}' is not unique",
                duplicate.name()
            )));
        }

        let identity = sha256_digest(
            format!(
                "{}|{}|{}",
                scopes.iter().map(Scope::as_str).collect::<Vec<_>>().join(","),
                stores.iter().map(|s| s.store_type()).collect::<Vec<_>>().join(","),
                policy.policy_type()
            )
            .as_bytes(),
        );
        let verifier_set_identity = sha256_digest(
            verifiers
                .iter()
                .map(|v| format!("{}:{}", v.name(), v.verifier_type()))
                .collect::<Vec<_>>()
                .join(",")
                .as_bytes(),
        );

        Ok(Self {
            scopes,
            identity,
            verifier_set_identity,
            components: Some(Components {
                stores,
                verifiers,
                policy,
            }),
            status: ExecutorStatus::ready(),
        })
    }

    /// Build an executor from configuration.
    ///
    /// Configuration errors (unknown types, invalid parameters, policies
    /// that cannot be satisfied) are returned before any trust material is
    /// fetched. A failure while initializing verifiers yields a `Failed`
    /// executor carrying the error in its status.
    pub async fn build(config: &ExecutorConfig, registry: &Registry) -> Result<Self> {
        config.validate()?;
        let scopes = config.parsed_scopes()?;
        let stores = config
            .stores
            .iter()
            .map(|store| registry.create_store(store))
            .collect::<Result<Vec<_>>>()?;
        let policy =
            registry.create_policy(config.policy_enforcer.as_ref(), &config.verifier_names())?;
        for verifier in &config.verifiers {
            registry.check_verifier(verifier)?;
        }

        let identity = config_identity(&(&config.scopes, &config.stores, &config.policy_enforcer));
        let verifier_set_identity = config_identity(&config.verifiers);

        match Self::build_verifiers(config, registry).await {
            Ok(verifiers) => {
                let executor = Self::new(scopes, stores, verifiers, policy)?;
                info!(
                    "executor for scopes [{}] ready with {} verifiers",
                    config.scopes.join(", "),
                    config.verifiers.len()
                );
                Ok(Self {
                    identity,
                    verifier_set_identity,
                    ..executor
                })
            }
            Err(e @ TrustError::Config(_)) => Err(e),
            Err(e) => {
                warn!(
                    "executor for scopes [{}] failed to initialize: {}",
                    config.scopes.join(", "),
                    e
                );
                Ok(Self {
                    scopes,
                    identity,
                    verifier_set_identity,
                    components: None,
                    status: ExecutorStatus::failed(&e),
                })
            }
        }
    }

    async fn build_verifiers(
        config: &ExecutorConfig,
        registry: &Registry,
    ) -> Result<Vec<Arc<dyn Verifier>>> {
        let mut verifiers = Vec::with_capacity(config.verifiers.len());
        for verifier in &config.verifiers {
            verifiers.push(registry.create_verifier(verifier).await?);
        }
        Ok(verifiers)
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn verifier_set_identity(&self) -> &str {
        &self.verifier_set_identity
    }

    pub fn status(&self) -> &ExecutorStatus {
        &self.status
    }

    pub fn is_ready(&self) -> bool {
        self.components.is_some()
    }

    fn components(&self) -> Result<&Components> {
        self.components.as_ref().ok_or_else(|| {
            TrustError::ExecutorNotReady(format!(
                "executor for scopes [{}] failed to initialize: {}",
                self.scope_list(),
                self.status.brief_error
            ))
        })
    }

    fn scope_list(&self) -> String {
        self.scopes
            .iter()
            .map(Scope::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Digest of the artifact's manifest. A digest reference is used as is;
    /// otherwise stores are asked in order until one answers.
    pub async fn resolve_digest(&self, reference: &ArtifactReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let components = self.components()?;
        let mut failures = Vec::new();
        for store in &components.stores {
            match store.resolve_digest(reference).await {
                Ok(digest) => return Ok(digest),
                Err(e) => {
                    debug!("{} store could not resolve {}: {}", store.store_type(), reference, e);
                    failures.push(format!("{}: {}", store.store_type(), e));
                }
            }
        }
        Err(TrustError::Store(format!(
            "failed to resolve digest of {}: {}",
            reference,
            failures.join("; ")
        )))
    }

    /// Signature metadata from the first store, in configured order, that
    /// answers without error.
    async fn fetch_signatures(
        &self,
        components: &Components,
        reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<Vec<SignatureMetadata>> {
        let mut failures = Vec::new();
        for store in &components.stores {
            match store.fetch_signature_metadata(reference, subject_digest).await {
                Ok(signatures) => {
                    debug!(
                        "{} store returned {} signatures for {}",
                        store.store_type(),
                        signatures.len(),
                        reference
                    );
                    return Ok(signatures);
                }
                Err(e) => {
                    debug!("{} store failed for {}: {}", store.store_type(), reference, e);
                    failures.push(format!("{}: {}", store.store_type(), e));
                }
            }
        }
        Err(TrustError::Store(format!(
            "failed to fetch signatures for {}: {}",
            reference,
            failures.join("; ")
        )))
    }

    /// Fetch signatures, run every verifier concurrently and apply the
    /// policy. Outcomes are reported in configured verifier order.
    ///
    /// Errors mean no decision could be reached (executor not ready, every
    /// store failing); verifier failures are part of the decision.
    pub async fn evaluate(
        &self,
        reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<TrustDecision> {
        let components = self.components()?;
        let signatures = Arc::new(self.fetch_signatures(components, reference, subject_digest).await?);
        let reference = Arc::new(reference.clone());

        // Dropping the set aborts any verifier still running.
        let mut tasks = JoinSet::new();
        for (index, verifier) in components.verifiers.iter().enumerate() {
            let verifier = Arc::clone(verifier);
            let reference = Arc::clone(&reference);
            let signatures = Arc::clone(&signatures);
            tasks.spawn(async move {
                (index, run_verifier(verifier.as_ref(), &reference, &signatures).await)
            });
        }

        let mut slots: Vec<Option<VerifierOutcome>> = vec![None; components.verifiers.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!("verifier task for {} did not complete: {}", reference, e),
            }
        }

        // An empty slot belongs to a verifier whose task panicked.
        let outcomes = slots
            .into_iter()
            .zip(&components.verifiers)
            .map(|(slot, verifier)| {
                slot.unwrap_or_else(|| {
                    VerifierOutcome::failed(
                        verifier.name(),
                        verifier.verifier_type(),
                        "verifier terminated unexpectedly",
                    )
                })
            })
            .collect();

        let decision = components.policy.evaluate(outcomes);
        debug!(
            "{} policy decided {} for {}",
            components.policy.policy_type(),
            if decision.succeeded { "pass" } else { "fail" },
            reference
        );
        Ok(decision)
    }
}

fn config_identity<T: Serialize>(value: &T) -> String {
    match serde_json::to_vec(value) {
        Ok(bytes) => sha256_digest(&bytes),
        Err(e) => {
            warn!("failed to serialize executor configuration: {}", e);
            String::new()
        }
    }
}
