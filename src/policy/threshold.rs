use crate::decision::{TrustDecision, VerifierOutcome};
use crate::policy::{failure_details, PolicyEnforcer};
use crate::{Result, TrustError};
use std::collections::BTreeSet;

pub const DEFAULT_THRESHOLD: usize = 1;

/// Succeeds when at least `threshold` counted verifiers pass. With a named
/// subset only those verifiers count; the others are still reported.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    threshold: usize,
    counted: Option<BTreeSet<String>>,
}

impl ThresholdPolicy {
    /// `configured` lists the executor's verifier names, used to reject
    /// thresholds that could never be met.
    pub fn new(
        threshold: Option<usize>,
        counted: Vec<String>,
        configured: &[String],
    ) -> Result<Self> {
        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        if threshold == 0 {
            return Err(TrustError::Config("threshold must be at least 1".into()));
        }

        let counted: Option<BTreeSet<String>> =
            (!counted.is_empty()).then(|| counted.into_iter().collect());

        if let Some(names) = &counted {
            if let Some(unknown) = names.iter().find(|name| !configured.contains(name)) {
                return Err(TrustError::Config(format!(
                    "threshold policy names unknown verifier '{}'",
                    unknown
                )));
            }
        }

        let eligible = counted.as_ref().map_or(configured.len(), BTreeSet::len);
        if threshold > eligible {
            return Err(TrustError::Config(format!(
                "threshold {} exceeds the {} verifiers it counts",
                threshold, eligible
            )));
        }

        Ok(Self { threshold, counted })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn counts(&self, outcome: &VerifierOutcome) -> bool {
        self.counted
            .as_ref()
            .map_or(true, |names| names.contains(&outcome.verifier_name))
    }
}

impl PolicyEnforcer for ThresholdPolicy {
    fn policy_type(&self) -> &'static str {
        "threshold"
    }

    fn evaluate(&self, outcomes: Vec<VerifierOutcome>) -> TrustDecision {
        let passed = outcomes
            .iter()
            .filter(|outcome| self.counts(outcome) && outcome.passed)
            .count();

        if passed >= self.threshold {
            return TrustDecision::success(outcomes);
        }

        let details = failure_details(outcomes.iter().filter(|outcome| self.counts(outcome)));
        let error = format!(
            "{} of {} required verifiers passed: {}",
            passed, self.threshold, details
        );
        TrustDecision::failure(error, outcomes)
    }
}

/// Every configured verifier must pass. Used when no policy is configured.
#[derive(Debug, Clone, Default)]
pub struct AllVerifiersPolicy;

impl PolicyEnforcer for AllVerifiersPolicy {
    fn policy_type(&self) -> &'static str {
        "all-verifiers"
    }

    fn evaluate(&self, outcomes: Vec<VerifierOutcome>) -> TrustDecision {
        if outcomes.is_empty() {
            return TrustDecision::failure("no verifier outcomes to evaluate", outcomes);
        }
        if outcomes.iter().all(|outcome| outcome.passed) {
            return TrustDecision::success(outcomes);
        }

        let failed = outcomes.iter().filter(|outcome| !outcome.passed).count();
        let error = format!(
            "{} of {} verifiers failed: {}",
            failed,
            outcomes.len(),
            failure_details(outcomes.iter())
        );
        TrustDecision::failure(error, outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn outcomes() -> Vec<VerifierOutcome> {
        vec![
            VerifierOutcome::passed("v1", "cosign", "ok"),
            VerifierOutcome::failed("v2", "notation", "bad chain"),
            VerifierOutcome::failed("v3", "notation", "no signatures"),
        ]
    }

    #[test]
    fn threshold_defaults_to_one() {
        let policy = ThresholdPolicy::new(None, vec![], &names(&["v1", "v2", "v3"])).unwrap();
        assert_eq!(policy.threshold(), 1);
        assert!(policy.evaluate(outcomes()).succeeded);
    }

    #[test]
    fn threshold_not_met_reports_failing_details() {
        let policy = ThresholdPolicy::new(Some(2), vec![], &names(&["v1", "v2", "v3"])).unwrap();
        let decision = policy.evaluate(outcomes());
        assert!(!decision.succeeded);
        assert!(decision.error.contains("1 of 2"));
        assert!(decision.error.contains("v2: bad chain"));
        assert!(decision.error.contains("v3: no signatures"));
        assert_eq!(decision.outcomes.len(), 3);
    }

    #[test]
    fn only_named_verifiers_count() {
        let policy =
            ThresholdPolicy::new(Some(1), names(&["v2", "v3"]), &names(&["v1", "v2", "v3"]))
                .unwrap();
        let decision = policy.evaluate(outcomes());
        assert!(!decision.succeeded);
        assert_eq!(decision.outcomes[0].verifier_name, "v1");
    }

    #[test]
    fn rejects_unsatisfiable_configuration() {
        let configured = names(&["v1", "v2"]);
        assert!(ThresholdPolicy::new(Some(0), vec![], &configured).is_err());
        assert!(ThresholdPolicy::new(Some(3), vec![], &configured).is_err());
        assert!(ThresholdPolicy::new(Some(1), names(&["v9"]), &configured).is_err());
        assert!(ThresholdPolicy::new(Some(2), names(&["v1"]), &configured).is_err());
    }

    #[test]
    fn all_verifiers_requires_every_pass() {
        let decision = AllVerifiersPolicy.evaluate(outcomes());
        assert!(!decision.succeeded);
        assert!(decision.error.starts_with("2 of 3 verifiers failed"));

        let decision =
            AllVerifiersPolicy.evaluate(vec![VerifierOutcome::passed("v1", "cosign", "ok")]);
        assert!(decision.succeeded);
        assert!(!AllVerifiersPolicy.evaluate(vec![]).succeeded);
    }
}
