use thiserror::Error;

pub mod cache;
pub mod config;
pub mod credentials;
pub mod decision;
pub mod engine;
pub mod executor;
pub mod keyprovider;
pub mod policy;
pub mod registry;
pub mod scope;
pub mod reference;
pub mod stores;
pub mod verifiers;

// Re-export commonly used types
pub use cache::{Cache, CacheError, MemoryCache};
pub use config::{CacheConfig, EngineConfig, ExecutorConfig, PolicyConfig, StoreConfig, VerifierConfig};
pub use decision::{DecisionResponse, TrustDecision, VerifierOutcome};
pub use engine::{Engine, EngineHandle};
pub use executor::{Executor, ExecutorStatus};
pub use keyprovider::{Certificate, CertificateSpec, KeyProvider, TrustMaterial};
pub use policy::PolicyEnforcer;
pub use reference::ArtifactReference;
pub use registry::Registry;
pub use scope::Scope;
pub use stores::{SignatureMetadata, Store};
pub use verifiers::{VerificationReport, Verifier};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("executor not ready: {0}")]
    ExecutorNotReady(String),

    #[error("key provider error: {0}")]
    KeyProvider(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("evaluation cancelled: {0}")]
    Cancelled(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrustError>;

/// Hex encoded SHA-256 of `data`, prefixed with the algorithm name.
pub fn sha256_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
