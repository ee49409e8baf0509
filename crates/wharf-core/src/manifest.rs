//! Manifest verification and linking
//!
//! A manifest is only accepted once its structure validates, its
//! signature verifies over the canonical payload, and every layer it
//! names is present in the blob store. Validation failures are
//! collected and returned together so a client can fix everything in
//! one round trip.
//!
//! Stored bytes are the exact PUT payload; the addressing digest is
//! computed over the canonical (signature-stripped) payload, and reads
//! serve the stored bytes untouched so signatures and digests stay
//! stable.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use wharf_storage::{StorageDriver, StorageError};

use crate::blobs::{BlobError, BlobStore};
use crate::digest::{Algorithm, Digest, DigestError, digest_of};
use crate::jws;
use crate::paths;

/// A manifest address: mutable tag or immutable digest
#[derive(Debug, Clone)]
pub enum ManifestRef {
    Tag(String),
    Digest(Digest),
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestRef::Tag(t) => f.write_str(t),
            ManifestRef::Digest(d) => write!(f, "{}", d),
        }
    }
}

/// A single reason a manifest was rejected
#[derive(Debug, Clone)]
pub enum Rejection {
    /// Structural violation (missing field, parallel-array mismatch,
    /// name/tag disagreement)
    Invalid(String),
    /// A referenced layer blob is not present
    BlobUnknown(Digest),
    /// A digest string failed to parse, or the asserted digest does not
    /// match the payload
    DigestInvalid(String),
    /// Signature verification failed
    Unverified(String),
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest unknown: {0}")]
    Unknown(String),

    #[error("Manifest rejected")]
    Rejected(Vec<Rejection>),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Validates, verifies, stores, and links manifests
pub struct ManifestService {
    driver: Arc<dyn StorageDriver>,
    blobs: Arc<BlobStore>,
}

impl ManifestService {
    pub fn new(driver: Arc<dyn StorageDriver>, blobs: Arc<BlobStore>) -> Self {
        Self { driver, blobs }
    }

    /// Validate and store a manifest, linking the tag when addressed by
    /// one. Returns the canonical digest.
    pub async fn put(
        &self,
        repository: &str,
        reference: &ManifestRef,
        raw: Bytes,
    ) -> Result<Digest, ManifestError> {
        let mut rejections = Vec::new();

        let doc: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                return Err(ManifestError::Rejected(vec![Rejection::Invalid(format!(
                    "malformed JSON: {}",
                    e
                ))]));
            }
        };

        // Structure
        if doc.get("schemaVersion").and_then(Value::as_u64).is_none() {
            rejections.push(Rejection::Invalid(
                "missing or invalid schemaVersion".to_string(),
            ));
        }
        match doc.get("name").and_then(Value::as_str) {
            None => rejections.push(Rejection::Invalid("missing name".to_string())),
            Some(n) if n != repository => rejections.push(Rejection::Invalid(format!(
                "manifest name {} does not match repository {}",
                n, repository
            ))),
            Some(_) => {}
        }
        let manifest_tag = doc.get("tag").and_then(Value::as_str);
        match manifest_tag {
            None => rejections.push(Rejection::Invalid("missing tag".to_string())),
            Some(t) => {
                if let ManifestRef::Tag(addressed) = reference
                    && t != addressed.as_str()
                {
                    rejections.push(Rejection::Invalid(format!(
                        "manifest tag {} does not match reference {}",
                        t, addressed
                    )));
                }
            }
        }

        let layers = doc.get("fsLayers").and_then(Value::as_array);
        let history = doc.get("history").and_then(Value::as_array);
        match (layers, history) {
            (None, _) => rejections.push(Rejection::Invalid("missing fsLayers".to_string())),
            (_, None) => rejections.push(Rejection::Invalid("missing history".to_string())),
            (Some(l), Some(h)) => {
                if l.is_empty() {
                    rejections.push(Rejection::Invalid("fsLayers must not be empty".to_string()));
                }
                if l.len() != h.len() {
                    rejections.push(Rejection::Invalid(format!(
                        "fsLayers has {} entries but history has {}",
                        l.len(),
                        h.len()
                    )));
                }
            }
        }

        // Layer digests and presence. Every missing blob is reported,
        // not just the first.
        let mut layer_digests = Vec::new();
        for layer in layers.map(Vec::as_slice).unwrap_or_default() {
            match layer.get("blobSum").and_then(Value::as_str) {
                None => rejections.push(Rejection::Invalid(
                    "fsLayers entry missing blobSum".to_string(),
                )),
                Some(s) => match s.parse::<Digest>() {
                    Ok(d) => layer_digests.push(d),
                    Err(_) => rejections.push(Rejection::DigestInvalid(s.to_string())),
                },
            }
        }
        for digest in &layer_digests {
            match self.blobs.stat(digest).await {
                Ok(Some(_)) => {}
                Ok(None) => rejections.push(Rejection::BlobUnknown(digest.clone())),
                Err(BlobError::Storage(e)) => return Err(ManifestError::Storage(e)),
                Err(BlobError::Digest(e)) => return Err(ManifestError::Digest(e)),
                Err(BlobError::Unknown(d)) => {
                    rejections.push(Rejection::BlobUnknown(
                        d.parse().unwrap_or_else(|_| digest.clone()),
                    ));
                }
            }
        }

        // Signature over the canonical payload
        let payload = match jws::verify(&raw, &doc) {
            Ok(p) => Some(p),
            Err(e) => {
                rejections.push(Rejection::Unverified(e.to_string()));
                None
            }
        };

        if let ManifestRef::Digest(asserted) = reference {
            if asserted.algorithm() != Algorithm::Sha256 {
                rejections.push(Rejection::DigestInvalid(format!(
                    "manifests are addressed by sha256, got {}",
                    asserted.algorithm()
                )));
            } else if let Some(p) = payload.as_ref() {
                let computed = digest_of(Algorithm::Sha256, p);
                if &computed != asserted {
                    rejections.push(Rejection::DigestInvalid(format!(
                        "asserted digest {} does not match payload digest {}",
                        asserted, computed
                    )));
                }
            }
        }

        if !rejections.is_empty() {
            debug!(
                "Rejecting manifest for {} with {} errors",
                repository,
                rejections.len()
            );
            return Err(ManifestError::Rejected(rejections));
        }

        let Some(payload) = payload else {
            return Err(ManifestError::Rejected(vec![Rejection::Unverified(
                "signature verification failed".to_string(),
            )]));
        };
        let canonical = digest_of(Algorithm::Sha256, &payload);

        // Writing an already-present revision is idempotent: the bytes
        // are identical by digest, and the driver put is atomic.
        self.driver
            .put(
                &paths::manifest_revision_data(repository, &canonical),
                raw.clone(),
            )
            .await?;

        if let ManifestRef::Tag(tag) = reference {
            // Single atomic link write; readers see the old digest or
            // the new one, never an intermediate state
            self.driver
                .put(
                    &paths::tag_current_link(repository, tag),
                    Bytes::from(canonical.to_string()),
                )
                .await?;
        }

        info!(
            "Stored manifest {}:{} -> {}",
            repository, reference, canonical
        );
        Ok(canonical)
    }

    /// Load a manifest's exact stored bytes and its canonical digest
    pub async fn get(
        &self,
        repository: &str,
        reference: &ManifestRef,
    ) -> Result<(Bytes, Digest), ManifestError> {
        let digest = match reference {
            ManifestRef::Digest(d) => d.clone(),
            ManifestRef::Tag(tag) => self.resolve_tag(repository, tag).await?,
        };

        let raw = self
            .driver
            .get(&paths::manifest_revision_data(repository, &digest))
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    ManifestError::Unknown(format!("{}:{}", repository, reference))
                }
                e => ManifestError::Storage(e),
            })?;

        Ok((raw, digest))
    }

    async fn resolve_tag(&self, repository: &str, tag: &str) -> Result<Digest, ManifestError> {
        let raw = self
            .driver
            .get(&paths::tag_current_link(repository, tag))
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    ManifestError::Unknown(format!("{}:{}", repository, tag))
                }
                e => ManifestError::Storage(e),
            })?;

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<Digest>().ok())
            .ok_or_else(|| {
                ManifestError::Storage(StorageError::Backend(format!(
                    "corrupt tag link for {}:{}",
                    repository, tag
                )))
            })
    }

    /// Delete a manifest revision. Tags pointing at it are left dangling
    /// and surface as unknown on their next resolution.
    pub async fn delete(&self, repository: &str, digest: &Digest) -> Result<(), ManifestError> {
        let data = paths::manifest_revision_data(repository, digest);
        if !self.driver.exists(&data).await? {
            return Err(ManifestError::Unknown(format!(
                "{}@{}",
                repository, digest
            )));
        }

        self.driver
            .delete_prefix(&paths::manifest_revision(repository, digest))
            .await?;
        info!("Deleted manifest {}@{}", repository, digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jws::testutil;
    use wharf_storage::MemoryDriver;

    struct Fixture {
        blobs: Arc<BlobStore>,
        manifests: ManifestService,
    }

    fn fixture() -> Fixture {
        let driver: Arc<MemoryDriver> = Arc::new(MemoryDriver::new());
        let blobs = Arc::new(BlobStore::new(driver.clone(), false));
        let manifests = ManifestService::new(driver, blobs.clone());
        Fixture { blobs, manifests }
    }

    fn manifest_json(name: &str, tag: &str, layers: &[&Digest]) -> String {
        let fs_layers: Vec<String> = layers
            .iter()
            .map(|d| format!("{{\"blobSum\":\"{}\"}}", d))
            .collect();
        let history: Vec<String> = layers
            .iter()
            .map(|_| "{\"v1Compatibility\":\"{}\"}".to_string())
            .collect();
        let unsigned = format!(
            "{{\"schemaVersion\":1,\"name\":\"{}\",\"tag\":\"{}\",\"architecture\":\"amd64\",\"fsLayers\":[{}],\"history\":[{}]}}",
            name,
            tag,
            fs_layers.join(","),
            history.join(",")
        );
        testutil::sign(&unsigned)
    }

    async fn seed_blob(fixture: &Fixture, content: &[u8]) -> Digest {
        let digest = digest_of(Algorithm::Sha256, content);
        fixture
            .blobs
            .put(&digest, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        digest
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip_bytes_exact() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer one").await;
        let raw = manifest_json("foo/bar", "v1", &[&layer]);

        let canonical = fx
            .manifests
            .put("foo/bar", &ManifestRef::Tag("v1".to_string()), Bytes::from(raw.clone()))
            .await
            .unwrap();

        let (by_tag, digest) = fx
            .manifests
            .get("foo/bar", &ManifestRef::Tag("v1".to_string()))
            .await
            .unwrap();
        assert_eq!(&by_tag[..], raw.as_bytes());
        assert_eq!(digest, canonical);

        let (by_digest, _) = fx
            .manifests
            .get("foo/bar", &ManifestRef::Digest(canonical.clone()))
            .await
            .unwrap();
        assert_eq!(&by_digest[..], raw.as_bytes());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer").await;
        let raw = Bytes::from(manifest_json("foo", "v1", &[&layer]));

        let first = fx
            .manifests
            .put("foo", &ManifestRef::Tag("v1".to_string()), raw.clone())
            .await
            .unwrap();
        let second = fx
            .manifests
            .put("foo", &ManifestRef::Digest(first.clone()), raw)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_rejections_are_collected() {
        let fx = fixture();

        // Unsigned manifest naming two absent blobs: every problem in
        // one response
        let missing_a = digest_of(Algorithm::Sha256, b"absent a");
        let missing_b = digest_of(Algorithm::Sha256, b"absent b");
        let raw = format!(
            "{{\"schemaVersion\":1,\"name\":\"foo\",\"tag\":\"v1\",\"fsLayers\":[{{\"blobSum\":\"{}\"}},{{\"blobSum\":\"{}\"}}],\"history\":[{{}},{{}}]}}",
            missing_a, missing_b
        );

        let err = fx
            .manifests
            .put("foo", &ManifestRef::Tag("v1".to_string()), Bytes::from(raw))
            .await
            .unwrap_err();

        let ManifestError::Rejected(rejections) = err else {
            panic!("expected rejection list");
        };
        let blobs_missing = rejections
            .iter()
            .filter(|r| matches!(r, Rejection::BlobUnknown(_)))
            .count();
        let unverified = rejections
            .iter()
            .filter(|r| matches!(r, Rejection::Unverified(_)))
            .count();
        assert_eq!(blobs_missing, 2);
        assert_eq!(unverified, 1);
    }

    #[tokio::test]
    async fn test_name_mismatch_rejected() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer").await;
        let raw = Bytes::from(manifest_json("other/name", "v1", &[&layer]));

        let err = fx
            .manifests
            .put("foo", &ManifestRef::Tag("v1".to_string()), raw)
            .await
            .unwrap_err();
        let ManifestError::Rejected(rejections) = err else {
            panic!("expected rejection list");
        };
        assert!(rejections.iter().any(|r| matches!(r, Rejection::Invalid(_))));
    }

    #[tokio::test]
    async fn test_parallel_array_invariant() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer").await;
        let unsigned = format!(
            "{{\"schemaVersion\":1,\"name\":\"foo\",\"tag\":\"v1\",\"fsLayers\":[{{\"blobSum\":\"{}\"}}],\"history\":[]}}",
            layer
        );
        let raw = Bytes::from(testutil::sign(&unsigned));

        let err = fx
            .manifests
            .put("foo", &ManifestRef::Tag("v1".to_string()), raw)
            .await
            .unwrap_err();
        let ManifestError::Rejected(rejections) = err else {
            panic!("expected rejection list");
        };
        assert!(rejections.iter().any(
            |r| matches!(r, Rejection::Invalid(msg) if msg.contains("history"))
        ));
    }

    #[tokio::test]
    async fn test_digest_addressed_mismatch() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer").await;
        let raw = Bytes::from(manifest_json("foo", "v1", &[&layer]));
        let wrong = digest_of(Algorithm::Sha256, b"not the payload");

        let err = fx
            .manifests
            .put("foo", &ManifestRef::Digest(wrong), raw)
            .await
            .unwrap_err();
        let ManifestError::Rejected(rejections) = err else {
            panic!("expected rejection list");
        };
        assert!(rejections.iter().any(|r| matches!(r, Rejection::DigestInvalid(_))));
    }

    #[tokio::test]
    async fn test_tag_moves_to_new_manifest() {
        let fx = fixture();
        let layer_a = seed_blob(&fx, b"first layer").await;
        let layer_b = seed_blob(&fx, b"second layer").await;

        let first = fx
            .manifests
            .put(
                "foo",
                &ManifestRef::Tag("latest".to_string()),
                Bytes::from(manifest_json("foo", "latest", &[&layer_a])),
            )
            .await
            .unwrap();
        let second = fx
            .manifests
            .put(
                "foo",
                &ManifestRef::Tag("latest".to_string()),
                Bytes::from(manifest_json("foo", "latest", &[&layer_b])),
            )
            .await
            .unwrap();
        assert_ne!(first, second);

        let (_, resolved) = fx
            .manifests
            .get("foo", &ManifestRef::Tag("latest".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved, second);

        // The old revision is still addressable by digest
        assert!(fx
            .manifests
            .get("foo", &ManifestRef::Digest(first))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_leaves_tag_dangling() {
        let fx = fixture();
        let layer = seed_blob(&fx, b"layer").await;
        let canonical = fx
            .manifests
            .put(
                "foo",
                &ManifestRef::Tag("v1".to_string()),
                Bytes::from(manifest_json("foo", "v1", &[&layer])),
            )
            .await
            .unwrap();

        fx.manifests.delete("foo", &canonical).await.unwrap();

        // Tag resolves to a digest whose revision is gone
        let err = fx
            .manifests
            .get("foo", &ManifestRef::Tag("v1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Unknown(_)));

        // Deleting again reports unknown
        assert!(matches!(
            fx.manifests.delete("foo", &canonical).await.unwrap_err(),
            ManifestError::Unknown(_)
        ));
    }
}
