use crate::cache::{Cache, CacheError, MemoryCache};
use crate::config::{check_scope_overlap, EngineConfig};
use crate::decision::{DecisionResponse, TrustDecision};
use crate::executor::{Executor, ExecutorStatus};
use crate::reference::ArtifactReference;
use crate::registry::Registry;
use crate::{sha256_digest, Result, TrustError};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Routes references to executors and memoizes their decisions.
pub struct Engine {
    executors: Vec<Executor>,
    cache: Arc<dyn Cache<TrustDecision>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(executors: Vec<Executor>, cache: Arc<dyn Cache<TrustDecision>>) -> Result<Self> {
        if executors.is_empty() {
            return Err(TrustError::Config("at least one executor must be configured".into()));
        }
        let scopes: Vec<_> = executors.iter().map(|e| e.scopes().to_vec()).collect();
        check_scope_overlap(&scopes)?;

        Ok(Self {
            executors,
            cache,
            in_flight: DashMap::new(),
        })
    }

    /// Validate `config` and build every executor through `registry`.
    /// Configuration errors are fatal; executors whose trust material fails
    /// to initialize are kept, in `Failed` state.
    pub async fn from_config(config: &EngineConfig, registry: &Registry) -> Result<Self> {
        config.validate()?;
        let cache = MemoryCache::new(config.cache.ttl_seconds, config.cache.max_entries)?;

        let mut executors = Vec::with_capacity(config.executors.len());
        for (i, executor) in config.executors.iter().enumerate() {
            let executor = Executor::build(executor, registry).await.map_err(|e| match e {
                TrustError::Config(message) => TrustError::Config(format!("executor {}: {}", i, message)),
                other => other,
            })?;
            executors.push(executor);
        }

        Self::new(executors, Arc::new(cache))
    }

    pub fn executors(&self) -> &[Executor] {
        &self.executors
    }

    /// Initialization status of every executor, in configured order.
    pub fn executor_statuses(&self) -> Vec<ExecutorStatus> {
        self.executors.iter().map(|e| e.status().clone()).collect()
    }

    /// Select the ready executor whose matching scope is the most specific.
    pub fn route(&self, reference: &ArtifactReference) -> Result<&Executor> {
        let matches: Vec<(&Executor, (bool, usize))> = self
            .executors
            .iter()
            .filter_map(|executor| {
                executor
                    .scopes()
                    .iter()
                    .filter(|scope| scope.matches(reference))
                    .map(|scope| scope.specificity())
                    .max()
                    .map(|specificity| (executor, specificity))
            })
            .collect();

        if matches.is_empty() {
            return Err(TrustError::Routing(format!(
                "no executor scope matches reference {}",
                reference
            )));
        }

        let ready: Vec<_> = matches.iter().filter(|(e, _)| e.is_ready()).collect();
        let Some(best) = ready.iter().map(|(_, specificity)| *specificity).max() else {
            return Err(TrustError::ExecutorNotReady(format!(
                "every executor matching {} failed to initialize: {}",
                reference,
                matches
                    .iter()
                    .map(|(e, _)| e.status().brief_error.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        };

        let mut winners = ready.iter().filter(|(_, specificity)| *specificity == best);
        match (winners.next(), winners.next()) {
            (Some((executor, _)), None) => Ok(*executor),
            _ => Err(TrustError::Routing(format!(
                "reference {} matches more than one executor with equal specificity",
                reference
            ))),
        }
    }

    /// Decide whether `reference` is trusted.
    ///
    /// Errors are reserved for requests that cannot be routed; fetch and
    /// verification failures come back as a failed decision. Only decisions
    /// reached by a policy are cached.
    pub async fn evaluate(&self, reference: &str) -> Result<TrustDecision> {
        let reference = ArtifactReference::parse(reference)?;
        let executor = self.route(&reference)?;

        let subject_digest = match executor.resolve_digest(&reference).await {
            Ok(digest) => digest,
            Err(e) => {
                debug!("not caching decision for {}: {}", reference, e);
                return Ok(TrustDecision::failure(e.to_string(), Vec::new()));
            }
        };

        let key = fingerprint(&subject_digest, executor);
        if let Some(decision) = self.cached(&key).await {
            return Ok(decision);
        }

        let flight = InFlight::join(&self.in_flight, &key);
        let _turn = flight.lock.lock().await;
        // Whoever held the lock before us may have filled the cache.
        if let Some(decision) = self.cached(&key).await {
            return Ok(decision);
        }

        let decision = match executor.evaluate(&reference, &subject_digest).await {
            Ok(decision) => decision,
            Err(TrustError::Store(message)) => {
                debug!("not caching decision for {}: {}", reference, message);
                return Ok(TrustDecision::failure(message, Vec::new()));
            }
            Err(e) => return Err(e),
        };

        match self.cache.set(&key, decision.clone(), Duration::ZERO).await {
            Ok(()) => trace!("cached decision for {} under {}", reference, key),
            Err(CacheError::AddFailed) => {
                debug!("cache refused decision for {}, returning it uncached", reference)
            }
            Err(e) => warn!("failed to cache decision for {}: {}", reference, e),
        }
        Ok(decision)
    }

    /// `evaluate` bounded by `timeout`. On expiry the evaluation is dropped,
    /// its verifier tasks are aborted and nothing is cached.
    pub async fn evaluate_with_timeout(
        &self,
        reference: &str,
        timeout: Duration,
    ) -> Result<TrustDecision> {
        tokio::time::timeout(timeout, self.evaluate(reference))
            .await
            .map_err(|_| {
                TrustError::Cancelled(format!(
                    "evaluation of {} exceeded {:?}",
                    reference, timeout
                ))
            })?
    }

    /// Answer an admission request. Every error becomes a deny.
    pub async fn decide(&self, reference: &str, include_outcomes: bool) -> DecisionResponse {
        let decision = match self.evaluate(reference).await {
            Ok(decision) => decision,
            Err(e) => TrustDecision::failure(e.to_string(), Vec::new()),
        };
        DecisionResponse::from_decision(&decision, include_outcomes)
    }

    async fn cached(&self, key: &str) -> Option<TrustDecision> {
        match self.cache.get(key).await {
            Ok(decision) => {
                trace!("decision cache hit for {}", key);
                Some(decision)
            }
            Err(_) => {
                trace!("decision cache miss for {}", key);
                None
            }
        }
    }
}

/// Cache key of a decision: the artifact digest and everything about the
/// executor that could change the outcome.
pub fn fingerprint(subject_digest: &str, executor: &Executor) -> String {
    sha256_digest(
        format!(
            "{}\n{}\n{}",
            subject_digest,
            executor.identity(),
            executor.verifier_set_identity()
        )
        .as_bytes(),
    )
}

/// Membership in the set of evaluations running for one fingerprint. The
/// map entry is removed when the last member leaves.
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn join(map: &'a DashMap<String, Arc<Mutex<()>>>, key: &str) -> Self {
        let lock = Arc::clone(&*map.entry(key.to_string()).or_default());
        Self {
            map,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // Two references: the map's and ours.
        self.map.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) <= 2
        });
    }
}

/// Active engine that can be replaced while requests are in flight.
/// Requests keep the engine they started with.
pub struct EngineHandle {
    current: ArcSwap<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            current: ArcSwap::from_pointee(engine),
        }
    }

    pub fn load(&self) -> Arc<Engine> {
        self.current.load_full()
    }

    /// Install `engine`, returning the one it replaces.
    pub fn swap(&self, engine: Engine) -> Arc<Engine> {
        self.current.swap(Arc::new(engine))
    }

    /// Build a new engine from `config` and install it. On error the active
    /// engine is left in place.
    pub async fn reload(&self, config: &EngineConfig, registry: &Registry) -> Result<()> {
        let engine = Engine::from_config(config, registry).await?;
        self.swap(engine);
        Ok(())
    }

    pub async fn evaluate(&self, reference: &str) -> Result<TrustDecision> {
        self.load().evaluate(reference).await
    }
}
