pub mod threshold;

use crate::decision::{TrustDecision, VerifierOutcome};

pub use threshold::{AllVerifiersPolicy, ThresholdPolicy};

/// Combines per-verifier outcomes into one decision.
pub trait PolicyEnforcer: Send + Sync {
    fn policy_type(&self) -> &'static str;

    /// `outcomes` arrive in configured verifier order and are kept in that
    /// order in the decision.
    fn evaluate(&self, outcomes: Vec<VerifierOutcome>) -> TrustDecision;
}

/// `name: detail` of every failing outcome, joined for the full diagnostic.
pub(crate) fn failure_details<'a>(outcomes: impl Iterator<Item = &'a VerifierOutcome>) -> String {
    outcomes
        .filter(|outcome| !outcome.passed)
        .map(|outcome| format!("{}: {}", outcome.verifier_name, outcome.detail))
        .collect::<Vec<_>>()
        .join("; ")
}
