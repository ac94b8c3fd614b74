//! Gene content access.
//!
//! [`GenePool`] is the contract the resolution engine consumes. The controller
//! binary backs it with [`LocalGenePool`], a content-addressed directory that a
//! separate sync process fills from the remote gene pool:
//!
//! ```text
//! <root>/<org>/<geneset>/<tag>/geneset.json   manifest: {"ref": "1.0"} or {"genes": {"catlet": "<hash>"}}
//! <root>/content/<hash>                       blob, keccak-256 of its bytes (hex)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tiny_keccak::{Hasher, Keccak};
use tracing::debug;

use crate::genes::{GeneSetIdentifier, UniqueGeneIdentifier};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const MANIFEST_FILE: &str = "geneset.json";
const CONTENT_DIR: &str = "content";
const MAX_REFERENCE_DEPTH: usize = 16;

/// Source of gene sets and gene content.
#[async_trait]
pub trait GenePool: Send + Sync {
    /// Pin a (possibly moving) tag. `Ok(None)` when the gene set is unknown.
    async fn resolve_gene_set(
        &self,
        id: &GeneSetIdentifier,
    ) -> Result<Option<GeneSetIdentifier>, BoxError>;

    /// Raw content of a gene. `Ok(None)` when the gene does not exist.
    async fn read_gene_content(
        &self,
        gene: &UniqueGeneIdentifier,
    ) -> Result<Option<Vec<u8>>, BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GenePoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest for {gene_set}: {reason}")]
    Manifest { gene_set: String, reason: String },
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("reference chain of {0} is too deep or loops")]
    ReferenceLoop(String),
}

/// Manifest stored per tag. A tag either references another tag of the same
/// gene set or lists its genes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneSetManifest {
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub genes: BTreeMap<String, String>,
}

/// keccak-256 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(bytes);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    hex::encode(out)
}

/// Directory backed, content-addressed gene cache.
pub struct LocalGenePool {
    root: PathBuf,
}

impl LocalGenePool {
    pub fn open(root: &Path) -> Result<Self, GenePoolError> {
        std::fs::create_dir_all(root.join(CONTENT_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn manifest_path(&self, id: &GeneSetIdentifier) -> PathBuf {
        self.root
            .join(id.organization())
            .join(id.geneset())
            .join(id.tag())
            .join(MANIFEST_FILE)
    }

    /// Store a blob and return its hash.
    pub async fn add_content(&self, bytes: &[u8]) -> Result<String, GenePoolError> {
        let hash = content_hash(bytes);
        tokio::fs::write(self.root.join(CONTENT_DIR).join(&hash), bytes).await?;
        Ok(hash)
    }

    /// Write (or replace) the manifest of a tag.
    pub async fn write_manifest(
        &self,
        id: &GeneSetIdentifier,
        manifest: &GeneSetManifest,
    ) -> Result<(), GenePoolError> {
        let path = self.manifest_path(id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_string_pretty(manifest).map_err(|e| GenePoolError::Manifest {
            gene_set: id.to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn read_manifest(
        &self,
        id: &GeneSetIdentifier,
    ) -> Result<Option<GeneSetManifest>, GenePoolError> {
        let data = match tokio::fs::read(self.manifest_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| GenePoolError::Manifest {
                gene_set: id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Follow tag references until a tag that lists genes.
    async fn pin(
        &self,
        id: &GeneSetIdentifier,
    ) -> Result<Option<(GeneSetIdentifier, GeneSetManifest)>, GenePoolError> {
        let mut current = id.clone();
        for _ in 0..MAX_REFERENCE_DEPTH {
            let Some(manifest) = self.read_manifest(&current).await? else {
                return Ok(None);
            };
            match manifest.reference.as_deref() {
                None => return Ok(Some((current, manifest))),
                Some(tag) => {
                    debug!(gene_set = %current, reference = %tag, "following gene set reference");
                    current = current.with_tag(tag).map_err(|e| GenePoolError::Manifest {
                        gene_set: current.to_string(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Err(GenePoolError::ReferenceLoop(id.to_string()))
    }
}

#[async_trait]
impl GenePool for LocalGenePool {
    async fn resolve_gene_set(
        &self,
        id: &GeneSetIdentifier,
    ) -> Result<Option<GeneSetIdentifier>, BoxError> {
        Ok(self.pin(id).await?.map(|(pinned, _)| pinned))
    }

    async fn read_gene_content(
        &self,
        gene: &UniqueGeneIdentifier,
    ) -> Result<Option<Vec<u8>>, BoxError> {
        let Some((_, manifest)) = self.pin(gene.id.gene_set()).await? else {
            return Ok(None);
        };
        let Some(expected) = manifest.genes.get(gene.id.name().as_str()) else {
            return Ok(None);
        };
        let path = self.root.join(CONTENT_DIR).join(expected);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GenePoolError::from(e).into()),
        };
        let actual = content_hash(&bytes);
        if &actual != expected {
            return Err(GenePoolError::HashMismatch {
                expected: expected.clone(),
                actual,
            }
            .into());
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genes::Architecture;
    use tempfile::tempdir;

    fn id(s: &str) -> GeneSetIdentifier {
        s.parse().unwrap()
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }

    #[tokio::test]
    async fn test_resolve_follows_references() {
        let dir = tempdir().unwrap();
        let pool = LocalGenePool::open(dir.path()).unwrap();
        let hash = pool.add_content(br#"{"name":"base"}"#).await.unwrap();

        let mut genes = BTreeMap::new();
        genes.insert("catlet".to_string(), hash);
        pool.write_manifest(&id("acme/base/1.0"), &GeneSetManifest { reference: None, genes })
            .await
            .unwrap();
        pool.write_manifest(
            &id("acme/base/latest"),
            &GeneSetManifest {
                reference: Some("1.0".to_string()),
                genes: BTreeMap::new(),
            },
        )
        .await
        .unwrap();

        let pinned = pool.resolve_gene_set(&id("acme/base")).await.unwrap();
        assert_eq!(pinned, Some(id("acme/base/1.0")));

        let missing = pool.resolve_gene_set(&id("acme/other")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_reference_loop_is_an_error() {
        let dir = tempdir().unwrap();
        let pool = LocalGenePool::open(dir.path()).unwrap();
        let reference = |tag: &str| GeneSetManifest {
            reference: Some(tag.to_string()),
            genes: BTreeMap::new(),
        };
        pool.write_manifest(&id("acme/base/a"), &reference("b")).await.unwrap();
        pool.write_manifest(&id("acme/base/b"), &reference("a")).await.unwrap();

        assert!(pool.resolve_gene_set(&id("acme/base/a")).await.is_err());
    }

    #[tokio::test]
    async fn test_read_content_verifies_hash() {
        let dir = tempdir().unwrap();
        let pool = LocalGenePool::open(dir.path()).unwrap();
        let hash = pool.add_content(b"payload").await.unwrap();
        let mut genes = BTreeMap::new();
        genes.insert("catlet".to_string(), hash.clone());
        pool.write_manifest(&id("acme/base/1.0"), &GeneSetManifest { reference: None, genes })
            .await
            .unwrap();

        let gene = UniqueGeneIdentifier::catlet(id("acme/base/1.0"), Architecture::Any);
        let content = pool.read_gene_content(&gene).await.unwrap();
        assert_eq!(content.as_deref(), Some(&b"payload"[..]));

        std::fs::write(dir.path().join(CONTENT_DIR).join(&hash), b"tampered").unwrap();
        assert!(pool.read_gene_content(&gene).await.is_err());
    }

    #[tokio::test]
    async fn test_read_missing_gene() {
        let dir = tempdir().unwrap();
        let pool = LocalGenePool::open(dir.path()).unwrap();
        let gene = UniqueGeneIdentifier::catlet(id("acme/none/1.0"), Architecture::Any);
        assert!(pool.read_gene_content(&gene).await.unwrap().is_none());
    }
}
