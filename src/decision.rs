use serde::{Deserialize, Serialize};

/// Upper bound on the length, in characters, of a user facing error.
pub const MAX_BRIEF_ERROR_LENGTH: usize = 100;

const ELLIPSIS: &str = "...";

/// Result of running one verifier during one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierOutcome {
    pub verifier_name: String,
    pub verifier_type: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl VerifierOutcome {
    pub fn passed(name: &str, verifier_type: &str, detail: impl Into<String>) -> Self {
        Self {
            verifier_name: name.to_string(),
            verifier_type: verifier_type.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn failed(name: &str, verifier_type: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            verifier_name: name.to_string(),
            verifier_type: verifier_type.to_string(),
            passed: false,
            detail: if detail.is_empty() {
                "verification failed".to_string()
            } else {
                detail
            },
        }
    }
}

/// Final pass/fail decision for one artifact, as cached and returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustDecision {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brief_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub outcomes: Vec<VerifierOutcome>,
}

impl TrustDecision {
    pub fn success(outcomes: Vec<VerifierOutcome>) -> Self {
        Self {
            succeeded: true,
            brief_error: String::new(),
            error: String::new(),
            outcomes,
        }
    }

    pub fn failure(error: impl Into<String>, outcomes: Vec<VerifierOutcome>) -> Self {
        let error = error.into();
        Self {
            succeeded: false,
            brief_error: truncate_brief(&error),
            error,
            outcomes,
        }
    }
}

/// Response handed back to the admission caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<VerifierOutcome>>,
}

impl DecisionResponse {
    /// Build the response, optionally exposing per-verifier detail for audit.
    pub fn from_decision(decision: &TrustDecision, include_outcomes: bool) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            succeeded: decision.succeeded,
            brief_error: non_empty(&decision.brief_error),
            error: non_empty(&decision.error),
            outcomes: include_outcomes.then(|| decision.outcomes.clone()),
        }
    }

    pub fn allowed(&self) -> bool {
        self.succeeded
    }
}

/// Shorten `message` to at most `MAX_BRIEF_ERROR_LENGTH` characters, marking
/// the cut with an ellipsis. Never splits a multi-byte character.
pub fn truncate_brief(message: &str) -> String {
    truncate_chars(message, MAX_BRIEF_ERROR_LENGTH)
}

pub(crate) fn truncate_chars(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }

    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let cut = message
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(message.len());

    format!("{}{}", &message[..cut], ELLIPSIS)
}
