mod common;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trust_engine::keyprovider::{SecretBundle, SecretStore};
use trust_engine::policy::{AllVerifiersPolicy, ThresholdPolicy};
use trust_engine::{
    ArtifactReference, DecisionResponse, Engine, EngineConfig, EngineHandle, Executor,
    MemoryCache, PolicyEnforcer, Registry, Result, Scope, SignatureMetadata, Store, TrustDecision,
    TrustError, VerificationReport, Verifier,
};

const DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

/// Store returning one placeholder signature and counting fetches.
#[derive(Default)]
struct CountingStore {
    fetches: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Store for CountingStore {
    async fn resolve_digest(&self, _reference: &ArtifactReference) -> Result<String> {
        if self.fail {
            return Err(TrustError::Store("registry unreachable".into()));
        }
        Ok(DIGEST.to_string())
    }

    async fn fetch_signature_metadata(
        &self,
        _reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<Vec<SignatureMetadata>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TrustError::Store("registry unreachable".into()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(vec![SignatureMetadata {
            subject_digest: subject_digest.to_string(),
            artifact_type: "application/vnd.test.signature".to_string(),
            digest: "sha256:signature".to_string(),
            payload: Vec::new(),
            signature: Vec::new(),
            certificate_chain: Vec::new(),
            annotations: Default::default(),
        }])
    }

    fn store_type(&self) -> &'static str {
        "counting"
    }
}

/// Verifier with a fixed verdict, reached after `delay`.
struct FixedVerifier {
    name: String,
    passes: bool,
    delay: Duration,
    finished: Arc<AtomicBool>,
}

impl FixedVerifier {
    fn new(name: &str, passes: bool, delay_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            passes,
            delay: Duration::from_millis(delay_ms),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Verifier for FixedVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn verifier_type(&self) -> &'static str {
        "fixed"
    }

    fn verifiable(&self, _signature: &SignatureMetadata) -> bool {
        true
    }

    async fn verify(
        &self,
        _reference: &ArtifactReference,
        signature: &SignatureMetadata,
    ) -> Result<VerificationReport> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        if !self.passes {
            return Err(TrustError::Verification(format!("{} rejected", self.name)));
        }
        Ok(VerificationReport {
            signature_digest: signature.digest.clone(),
            signer: None,
            messages: Vec::new(),
        })
    }
}

/// Verifier that panics while verifying.
struct PanickingVerifier;

#[async_trait]
impl Verifier for PanickingVerifier {
    fn name(&self) -> &str {
        "panics"
    }

    fn verifier_type(&self) -> &'static str {
        "fixed"
    }

    fn verifiable(&self, _signature: &SignatureMetadata) -> bool {
        true
    }

    async fn verify(
        &self,
        _reference: &ArtifactReference,
        _signature: &SignatureMetadata,
    ) -> Result<VerificationReport> {
        panic!("verifier bug");
    }
}

fn scopes(patterns: &[&str]) -> Vec<Scope> {
    patterns.iter().map(|p| Scope::parse(p).unwrap()).collect()
}

fn names(verifiers: &[Arc<dyn Verifier>]) -> Vec<String> {
    verifiers.iter().map(|v| v.name().to_string()).collect()
}

fn executor(
    patterns: &[&str],
    store: Arc<CountingStore>,
    verifiers: Vec<Arc<dyn Verifier>>,
    policy: Arc<dyn PolicyEnforcer>,
) -> Executor {
    Executor::new(scopes(patterns), vec![store], verifiers, policy).unwrap()
}

fn decision_cache() -> Arc<MemoryCache<TrustDecision>> {
    Arc::new(MemoryCache::new(600, 100).unwrap())
}

/// V1 passes slowly, V2 fails at once.
fn threshold_engine(threshold: usize) -> Engine {
    let verifiers: Vec<Arc<dyn Verifier>> = vec![
        Arc::new(FixedVerifier::new("v1", true, 50)),
        Arc::new(FixedVerifier::new("v2", false, 0)),
    ];
    let policy = ThresholdPolicy::new(Some(threshold), vec![], &names(&verifiers)).unwrap();
    let executor = executor(
        &["*.a.io"],
        Arc::new(CountingStore::default()),
        verifiers,
        Arc::new(policy),
    );
    Engine::new(vec![executor], decision_cache()).unwrap()
}

#[tokio::test]
async fn test_threshold_one_passes_with_stable_order() -> Result<()> {
    let decision = threshold_engine(1).evaluate("x.a.io/app:v1").await?;

    assert!(decision.succeeded);
    assert!(decision.brief_error.is_empty());
    let order: Vec<_> = decision.outcomes.iter().map(|o| o.verifier_name.as_str()).collect();
    assert_eq!(order, vec!["v1", "v2"]);
    assert!(decision.outcomes[0].passed);
    assert!(!decision.outcomes[1].passed);
    Ok(())
}

#[tokio::test]
async fn test_threshold_two_fails() -> Result<()> {
    let decision = threshold_engine(2).evaluate("x.a.io/app:v1").await?;

    assert!(!decision.succeeded);
    assert!(decision.error.contains("v2 rejected"));
    assert!(!decision.brief_error.is_empty());
    assert!(decision.brief_error.chars().count() <= 100);
    let order: Vec<_> = decision.outcomes.iter().map(|o| o.verifier_name.as_str()).collect();
    assert_eq!(order, vec!["v1", "v2"]);
    Ok(())
}

#[tokio::test]
async fn test_routing_by_scope() -> Result<()> {
    let a = executor(
        &["*.a.io"],
        Arc::new(CountingStore::default()),
        vec![Arc::new(FixedVerifier::new("a", true, 0))],
        Arc::new(AllVerifiersPolicy),
    );
    let b = executor(
        &["*.b.io"],
        Arc::new(CountingStore::default()),
        vec![Arc::new(FixedVerifier::new("b", false, 0))],
        Arc::new(AllVerifiersPolicy),
    );
    let engine = Engine::new(vec![a, b], decision_cache())?;

    let reference = ArtifactReference::parse("x.a.io/team/app:v1")?;
    assert_eq!(engine.route(&reference)?.scopes()[0].as_str(), "*.a.io");

    let decision = engine.evaluate("x.a.io/team/app:v1").await?;
    assert!(decision.succeeded);
    assert_eq!(decision.outcomes[0].verifier_name, "a");

    let decision = engine.evaluate("y.b.io/app:v1").await?;
    assert!(!decision.succeeded);
    assert_eq!(decision.outcomes[0].verifier_name, "b");

    let err = engine.evaluate("x.c.io/app:v1").await.unwrap_err();
    assert!(matches!(err, TrustError::Routing(ref m) if m.contains("x.c.io/app:v1")));
    Ok(())
}

#[tokio::test]
async fn test_most_specific_scope_wins() -> Result<()> {
    let broad = executor(
        &["*.a.io"],
        Arc::new(CountingStore::default()),
        vec![Arc::new(FixedVerifier::new("broad", true, 0))],
        Arc::new(AllVerifiersPolicy),
    );
    let narrow = executor(
        &["x.a.io/team/*"],
        Arc::new(CountingStore::default()),
        vec![Arc::new(FixedVerifier::new("narrow", true, 0))],
        Arc::new(AllVerifiersPolicy),
    );
    let engine = Engine::new(vec![broad, narrow], decision_cache())?;

    let decision = engine.evaluate("x.a.io/team/app:v1").await?;
    assert_eq!(decision.outcomes[0].verifier_name, "narrow");
    let decision = engine.evaluate("x.a.io/other/app:v1").await?;
    assert_eq!(decision.outcomes[0].verifier_name, "broad");
    Ok(())
}

fn scoped(pattern: &str, verifier: &str) -> Executor {
    executor(
        &[pattern],
        Arc::new(CountingStore::default()),
        vec![Arc::new(FixedVerifier::new(verifier, true, 0))],
        Arc::new(AllVerifiersPolicy),
    )
}

#[test]
fn test_ambiguous_scopes_are_rejected_at_load() {
    let result = Engine::new(vec![scoped("*.a.io", "a"), scoped("x.*.io", "b")], decision_cache());
    assert!(matches!(result, Err(TrustError::Config(ref m)) if m.contains("equal specificity")));

    let result = Engine::new(vec![scoped("*.a.io", "a"), scoped("*.a.io", "b")], decision_cache());
    assert!(matches!(result, Err(TrustError::Config(_))));
}

#[tokio::test]
async fn test_nested_literal_scope_wins() -> Result<()> {
    let engine = Engine::new(vec![scoped("*.a.io", "broad"), scoped("x.a.io", "exact")], decision_cache())?;

    let decision = engine.evaluate("x.a.io/app:v1").await?;
    assert_eq!(decision.outcomes[0].verifier_name, "exact");
    let decision = engine.evaluate("y.a.io/app:v1").await?;
    assert_eq!(decision.outcomes[0].verifier_name, "broad");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_evaluations_agree() -> Result<()> {
    let store = Arc::new(CountingStore::default());
    let verifiers: Vec<Arc<dyn Verifier>> = vec![
        Arc::new(FixedVerifier::new("v1", true, 20)),
        Arc::new(FixedVerifier::new("v2", false, 5)),
    ];
    let policy = ThresholdPolicy::new(Some(1), vec![], &names(&verifiers))?;
    let engine = Arc::new(Engine::new(
        vec![executor(&["*.a.io"], store.clone(), verifiers, Arc::new(policy))],
        decision_cache(),
    )?);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.evaluate("x.a.io/app:v1").await }));
    }

    let mut decisions = Vec::new();
    for handle in handles {
        decisions.push(handle.await.unwrap()?);
    }

    let first = &decisions[0];
    for decision in &decisions {
        assert_eq!(decision.succeeded, first.succeeded);
        assert_eq!(decision.brief_error, first.brief_error);
        assert_eq!(decision.outcomes, first.outcomes);
    }
    // Identical requests coalesce into one upstream fetch.
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_evaluation_is_not_cached() -> Result<()> {
    let slow = FixedVerifier::new("slow", true, 500);
    let finished = slow.finished.clone();
    let store = Arc::new(CountingStore::default());
    let cache = decision_cache();
    let engine = Engine::new(
        vec![executor(
            &["*.a.io"],
            store.clone(),
            vec![Arc::new(slow)],
            Arc::new(AllVerifiersPolicy),
        )],
        cache.clone(),
    )?;

    let err = engine
        .evaluate_with_timeout("x.a.io/app:v1", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::Cancelled(_)));
    assert!(cache.is_empty());

    // The abandoned verifier task is aborted rather than left running.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!finished.load(Ordering::SeqCst));
    assert!(cache.is_empty());

    // A later evaluation computes from scratch and is cached.
    let decision = engine.evaluate("x.a.io/app:v1").await?;
    assert!(decision.succeeded);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_decisions_are_cached() -> Result<()> {
    let store = Arc::new(CountingStore::default());
    let cache = decision_cache();
    let engine = Engine::new(
        vec![executor(
            &["*.a.io"],
            store.clone(),
            vec![Arc::new(FixedVerifier::new("v1", true, 0))],
            Arc::new(AllVerifiersPolicy),
        )],
        cache.clone(),
    )?;

    let first = engine.evaluate("x.a.io/app:v1").await?;
    let second = engine.evaluate(&format!("x.a.io/app@{}", DIGEST)).await?;
    assert_eq!(first, second);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_store_failures_are_denials_not_errors() -> Result<()> {
    let failing = Arc::new(CountingStore {
        fail: true,
        ..Default::default()
    });
    let cache = decision_cache();
    let engine = Engine::new(
        vec![executor(
            &["*.a.io"],
            failing,
            vec![Arc::new(FixedVerifier::new("v1", true, 0))],
            Arc::new(AllVerifiersPolicy),
        )],
        cache.clone(),
    )?;

    let decision = engine.evaluate(&format!("x.a.io/app@{}", DIGEST)).await?;
    assert!(!decision.succeeded);
    assert!(decision.error.contains("registry unreachable"));
    assert!(cache.is_empty());

    let decision = engine.evaluate("x.a.io/app:v1").await?;
    assert!(!decision.succeeded);
    assert!(decision.error.contains("failed to resolve digest"));
    Ok(())
}

#[tokio::test]
async fn test_later_store_is_used_when_earlier_fails() -> Result<()> {
    let failing = Arc::new(CountingStore {
        fail: true,
        ..Default::default()
    });
    let working = Arc::new(CountingStore::default());
    let executor = Executor::new(
        scopes(&["*.a.io"]),
        vec![failing.clone(), working.clone()],
        vec![Arc::new(FixedVerifier::new("v1", true, 0))],
        Arc::new(AllVerifiersPolicy),
    )?;
    let engine = Engine::new(vec![executor], decision_cache())?;

    let decision = engine.evaluate("x.a.io/app:v1").await?;
    assert!(decision.succeeded);
    assert_eq!(failing.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(working.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_panicking_verifier_is_isolated() -> Result<()> {
    let verifiers: Vec<Arc<dyn Verifier>> = vec![
        Arc::new(PanickingVerifier),
        Arc::new(FixedVerifier::new("v2", true, 0)),
    ];
    let policy = ThresholdPolicy::new(Some(1), vec![], &names(&verifiers))?;
    let engine = Engine::new(
        vec![executor(
            &["*.a.io"],
            Arc::new(CountingStore::default()),
            verifiers,
            Arc::new(policy),
        )],
        decision_cache(),
    )?;

    let decision = engine.evaluate("x.a.io/app:v1").await?;
    assert!(decision.succeeded);
    assert_eq!(decision.outcomes[0].verifier_name, "panics");
    assert!(!decision.outcomes[0].passed);
    assert!(decision.outcomes[1].passed);
    Ok(())
}

#[test]
fn test_executor_requires_unique_verifier_names() {
    let result = Executor::new(
        scopes(&["*.a.io"]),
        vec![Arc::new(CountingStore::default())],
        vec![
            Arc::new(FixedVerifier::new("v", true, 0)),
            Arc::new(FixedVerifier::new("v", false, 0)),
        ],
        Arc::new(AllVerifiersPolicy),
    );
    assert!(matches!(result, Err(TrustError::Config(_))));
}

/// Local store with one cosign and one notation signature for the fixture
/// digest, plus the engine configuration verifying both.
async fn signed_fixture(dir: &TempDir, policy: serde_json::Value) -> EngineConfig {
    let digest = subject_digest();
    let key = cosign_key();
    write_envelope(dir.path(), &digest, "cosign.json", &cosign_envelope(&key, &digest)).await;
    write_envelope(dir.path(), &digest, "notation.json", &notation_envelope(&digest, &[LEAF_PEM])).await;

    let config = json!({
        "executors": [{
            "scopes": ["registry.example.io"],
            "stores": [{"type": "local", "parameters": {"path": dir.path()}}],
            "verifiers": [
                {"name": "cosign", "type": "cosign", "parameters": {"publicKeys": [public_key_pem(&key)]}},
                {"name": "notation", "type": "notation", "parameters": {
                    "keyProvider": {"type": "inline", "parameters": {"pem": ROOT_PEM}}
                }}
            ],
            "policyEnforcer": policy
        }],
        "cache": {"ttlSeconds": 60, "maxEntries": 100}
    });
    EngineConfig::from_json_str(&config.to_string()).unwrap()
}

#[tokio::test]
async fn test_engine_from_config_end_to_end() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = signed_fixture(&dir, json!({"type": "threshold", "parameters": {"threshold": 2}})).await;
    let engine = Engine::from_config(&config, &Registry::with_builtins()).await?;

    assert!(engine.executor_statuses().iter().all(|s| s.succeeded));

    let reference = format!("registry.example.io/app@{}", subject_digest());
    let decision = engine.evaluate(&reference).await?;
    assert!(decision.succeeded, "{}", decision.error);
    assert_eq!(decision.outcomes.len(), 2);
    assert_eq!(decision.outcomes[0].verifier_name, "cosign");
    assert_eq!(decision.outcomes[1].verifier_name, "notation");

    let response = engine.decide(&reference, true).await;
    assert!(response.allowed());
    assert_eq!(response.outcomes.map(|o| o.len()), Some(2));

    let response: DecisionResponse = engine.decide("registry.example.io/unsigned@sha256:2222222222222222222222222222222222222222222222222222222222222222", false).await;
    assert!(!response.allowed());
    assert!(response.brief_error.is_some());
    assert!(response.outcomes.is_none());
    Ok(())
}

/// Secret store whose backend cannot be reached.
struct UnreachableSecretStore;

#[async_trait]
impl SecretStore for UnreachableSecretStore {
    async fn get_secret(&self, name: &str, _version: &str) -> Result<SecretBundle> {
        Err(TrustError::KeyProvider(format!("secret {}: connection refused", name)))
    }

    fn store_type(&self) -> &'static str {
        "unreachable"
    }
}

fn unreachable_vault_registry() -> Registry {
    let mut registry = Registry::with_builtins();
    registry.register_secret_store("vault", Arc::new(UnreachableSecretStore));
    registry
}

fn vault_backed_verifier() -> serde_json::Value {
    json!({
        "name": "notation",
        "type": "notation",
        "parameters": {"keyProvider": {"type": "secret-store", "parameters": {
            "store": "vault",
            "certificates": [{"name": "root"}]
        }}}
    })
}

#[tokio::test]
async fn test_failed_executor_is_not_ready() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = json!({
        "executors": [{
            "scopes": ["registry.example.io"],
            "stores": [{"type": "local", "parameters": {"path": dir.path()}}],
            "verifiers": [vault_backed_verifier()]
        }]
    });
    let config = EngineConfig::from_json_str(&config.to_string())?;
    let engine = Engine::from_config(&config, &unreachable_vault_registry()).await?;

    let statuses = engine.executor_statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].succeeded);
    assert!(statuses[0].error.contains("failed to fetch certificates during initialization"));
    assert!(statuses[0].brief_error.chars().count() <= 100);

    let err = engine
        .evaluate(&format!("registry.example.io/app@{}", subject_digest()))
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::ExecutorNotReady(_)));
    Ok(())
}

#[tokio::test]
async fn test_configuration_errors_fail_the_load() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let load = |verifiers: serde_json::Value, policy: serde_json::Value| {
        let config = json!({
            "executors": [{
                "scopes": ["registry.example.io"],
                "stores": [{"type": "local", "parameters": {"path": dir.path()}}],
                "verifiers": verifiers,
                "policyEnforcer": policy
            }]
        });
        EngineConfig::from_json_str(&config.to_string())
    };
    let registry = unreachable_vault_registry();
    let all = json!({"type": "all-verifiers"});

    // Checked before the unreachable vault is contacted.
    let config = load(json!([vault_backed_verifier(), {"name": "v2", "type": "bogus"}]), all.clone())?;
    let err = Engine::from_config(&config, &registry).await.err().unwrap();
    assert!(matches!(err, TrustError::Config(ref m) if m.contains("unknown verifier type 'bogus'")));

    let config = load(
        json!([vault_backed_verifier()]),
        json!({"type": "threshold", "parameters": {"threshold": 5}}),
    )?;
    let err = Engine::from_config(&config, &registry).await.err().unwrap();
    assert!(matches!(err, TrustError::Config(ref m) if m.starts_with("executor 0: ")));

    let config = load(json!([{"name": "v1", "type": "cosign", "parameters": {}}]), all)?;
    let err = Engine::from_config(&config, &registry).await.err().unwrap();
    assert!(matches!(err, TrustError::Config(ref m) if m.contains("either keyProvider or publicKeys")));
    Ok(())
}

#[tokio::test]
async fn test_engine_handle_swaps_configuration() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let registry = Registry::with_builtins();
    let reference = format!("registry.example.io/app@{}", subject_digest());

    let strict = signed_fixture(&dir, json!({"type": "threshold", "parameters": {"threshold": 2}})).await;
    let handle = EngineHandle::new(Engine::from_config(&strict, &registry).await?);
    let held = handle.load();
    assert!(handle.evaluate(&reference).await?.succeeded);

    // Only the notation verifier counts, and it now trusts an unrelated root.
    let mut lenient = strict.clone();
    lenient.executors[0].verifiers[1].parameters =
        json!({"keyProvider": {"type": "inline", "parameters": {"pem": OTHER_ROOT_PEM}}});
    lenient.executors[0].policy_enforcer = Some(trust_engine::PolicyConfig {
        policy_type: "threshold".to_string(),
        parameters: json!({"verifiers": ["notation"]}),
    });
    handle.reload(&lenient, &registry).await?;

    assert!(!handle.evaluate(&reference).await?.succeeded);
    // Requests that captured the previous engine keep using it.
    assert!(held.evaluate(&reference).await?.succeeded);
    Ok(())
}
