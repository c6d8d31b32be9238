use crate::reference::ArtifactReference;
use crate::stores::{SignatureEnvelope, SignatureMetadata, Store};
use crate::{sha256_digest, Result, TrustError};
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const INDEX_FILE: &str = "index.json";

/// Directory backed store.
///
/// Signatures for a subject live in `<root>/<algorithm>-<hex>/*.json`, one
/// envelope per file, read in file name order. Tags resolve through an
/// optional `<root>/index.json` mapping `registry/repository:tag` to a digest.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the signatures of `subject_digest`.
    pub fn signature_dir(&self, subject_digest: &str) -> PathBuf {
        self.root.join(subject_digest.replace(':', "-"))
    }

    async fn load_index(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(self.root.join(INDEX_FILE)).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(TrustError::Io(e)),
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn resolve_digest(&self, reference: &ArtifactReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let key = format!("{}:{}", reference.scope_target(), reference.manifest_reference());
        self.load_index().await?.remove(&key).ok_or_else(|| {
            TrustError::Store(format!("{} not found in {}", key, self.root.display()))
        })
    }

    async fn fetch_signature_metadata(
        &self,
        _reference: &ArtifactReference,
        subject_digest: &str,
    ) -> Result<Vec<SignatureMetadata>> {
        let dir = self.signature_dir(subject_digest);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no signature directory {}", dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(TrustError::Io(e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut signatures = Vec::with_capacity(paths.len());
        for path in paths {
            trace!("loading signature envelope {}", path.display());
            let content = fs::read(&path).await?;
            let envelope = SignatureEnvelope::from_slice(&content).map_err(|e| {
                TrustError::Store(format!("{}: {}", path.display(), e))
            })?;
            signatures.push(envelope.into_metadata(
                subject_digest,
                sha256_digest(&content),
                "",
            )?);
        }

        Ok(signatures)
    }

    fn store_type(&self) -> &'static str {
        "Local"
    }
}
