use crate::{Result, TrustError};
use std::fmt;
use std::str::FromStr;

const DEFAULT_REGISTRY: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";

/// Location and identity of an artifact in a registry.
///
/// Accepts `[host[:port]/]repository[:tag][@algorithm:hex]`. Bare names such
/// as `alpine:3` resolve to `docker.io/library/alpine:3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactReference {
    original: String,
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ArtifactReference {
    pub fn parse(input: &str) -> Result<Self> {
        let original = input.trim();
        if original.is_empty() {
            return Err(TrustError::InvalidReference("reference is empty".into()));
        }
        if original.chars().any(char::is_whitespace) {
            return Err(TrustError::InvalidReference(format!(
                "reference '{}' contains whitespace",
                original
            )));
        }

        let (name_and_tag, digest) = match original.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest)?;
                (name, Some(digest.to_string()))
            }
            None => (original, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => (
                &name_and_tag[..colon],
                Some(name_and_tag[colon + 1..].to_string()),
            ),
            _ => (name_and_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(TrustError::InvalidReference(format!(
                "reference '{}' has an empty tag",
                original
            )));
        }

        let (registry, repository) = split_registry(name);
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(TrustError::InvalidReference(format!(
                "reference '{}' has an invalid repository",
                original
            )));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(TrustError::InvalidReference(format!(
                "repository '{}' must be lowercase",
                repository
            )));
        }

        Ok(Self {
            original: original.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, the portion scopes are matched against.
    pub fn scope_target(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The reference text as supplied by the caller.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Tag or digest to address the manifest with, preferring the digest.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    /// Copy of this reference pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        let mut pinned = self.clone();
        pinned.digest = Some(digest.to_string());
        pinned
    }
}

impl FromStr for ArtifactReference {
    type Err = TrustError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

fn split_registry(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        None => (
            DEFAULT_REGISTRY.to_string(),
            format!("{}/{}", OFFICIAL_NAMESPACE, name),
        ),
    }
}

/// Check `algorithm:hex` digest syntax.
pub fn validate_digest(digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        TrustError::InvalidReference(format!("digest '{}' is missing an algorithm", digest))
    })?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => {
            return Err(TrustError::InvalidReference(format!(
                "unsupported digest algorithm '{}'",
                other
            )))
        }
    };

    if encoded.len() != expected_len || !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TrustError::InvalidReference(format!(
            "digest '{}' is not a valid {} digest",
            digest, algorithm
        )));
    }
    Ok(())
}
