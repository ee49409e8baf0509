//! Content-addressed blob store
//!
//! A thin integrity layer over the storage driver: blobs are keyed by
//! digest, nothing is linked in until its digest has been recomputed,
//! and reads can be verified as bytes flow when the backend is not
//! trusted.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{debug, info};
use wharf_storage::{ByteStream, StorageDriver, StorageError};

use crate::digest::{Digest, DigestError, Verifier, digest_of};
use crate::paths;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob unknown: {0}")]
    Unknown(String),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Descriptor of a stored blob
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

/// Content-addressed blob store
pub struct BlobStore {
    driver: Arc<dyn StorageDriver>,
    /// When the backing storage is not trusted, reads recompute the
    /// digest as bytes flow and fail at end of stream on mismatch.
    verify_on_read: bool,
}

impl BlobStore {
    pub fn new(driver: Arc<dyn StorageDriver>, verify_on_read: bool) -> Self {
        Self {
            driver,
            verify_on_read,
        }
    }

    /// Get the size of a blob, or None if it is not present
    pub async fn stat(&self, digest: &Digest) -> Result<Option<u64>, BlobError> {
        match self.driver.stat(&paths::blob_data(digest)).await {
            Ok(size) => Ok(Some(size)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(BlobError::Storage(e)),
        }
    }

    /// Open a blob for streaming reads
    pub async fn open(&self, digest: &Digest) -> Result<(ByteStream, u64), BlobError> {
        let path = paths::blob_data(digest);
        let size = match self.driver.stat(&path).await {
            Ok(size) => size,
            Err(StorageError::NotFound(_)) => {
                return Err(BlobError::Unknown(digest.to_string()));
            }
            Err(e) => return Err(BlobError::Storage(e)),
        };

        let stream = self.driver.reader(&path).await.map_err(|e| match e {
            StorageError::NotFound(_) => BlobError::Unknown(digest.to_string()),
            e => BlobError::Storage(e),
        })?;

        if self.verify_on_read {
            debug!("Verifying blob on read: {}", digest);
            Ok((
                Box::pin(VerifyingStream::new(stream, digest.clone())),
                size,
            ))
        } else {
            Ok((stream, size))
        }
    }

    /// Write a blob directly, verifying the digest first.
    ///
    /// Chunked uploads go through `adopt_staged` instead; this path
    /// serves small, fully-buffered writes.
    pub async fn put(&self, digest: &Digest, data: Bytes) -> Result<Descriptor, BlobError> {
        let computed = digest_of(digest.algorithm(), &data);
        if &computed != digest {
            return Err(BlobError::Digest(DigestError::Mismatch {
                expected: digest.to_string(),
                actual: computed.to_string(),
            }));
        }

        let size = data.len() as u64;
        self.driver.put(&paths::blob_data(digest), data).await?;
        Ok(Descriptor {
            digest: digest.clone(),
            size,
            media_type: "application/octet-stream".to_string(),
        })
    }

    /// Move verified staged bytes into the content-addressed location.
    ///
    /// The caller has already recomputed and checked the digest over the
    /// staged bytes; this performs the final rename. A blob already at
    /// the destination makes the move a no-op (identical content).
    pub async fn adopt_staged(
        &self,
        staged_path: &str,
        digest: &Digest,
        size: u64,
    ) -> Result<Descriptor, BlobError> {
        let dest = paths::blob_data(digest);

        if self.driver.exists(&dest).await? {
            debug!("Blob {} already present, dropping staged copy", digest);
            self.driver.delete(staged_path).await?;
        } else {
            self.driver.rename(staged_path, &dest).await?;
        }

        info!("Committed blob {} ({} bytes)", digest, size);
        Ok(Descriptor {
            digest: digest.clone(),
            size,
            media_type: "application/octet-stream".to_string(),
        })
    }

    /// Delete a blob. Returns Unknown if it was not present.
    ///
    /// Feature-flag enforcement happens at the API boundary; the store
    /// always knows how.
    pub async fn delete(&self, digest: &Digest) -> Result<(), BlobError> {
        let dir = format!(
            "blobs/{}/{}/{}",
            digest.algorithm(),
            &digest.hex()[..2],
            digest.hex()
        );
        if !self.driver.exists(&paths::blob_data(digest)).await? {
            return Err(BlobError::Unknown(digest.to_string()));
        }
        self.driver.delete_prefix(&dir).await?;
        info!("Deleted blob {}", digest);
        Ok(())
    }
}

/// A stream wrapper that hashes bytes as they flow and yields a terminal
/// error if the computed digest does not match the requested one.
struct VerifyingStream {
    inner: ByteStream,
    verifier: Verifier,
    expected: Digest,
    done: bool,
}

impl VerifyingStream {
    fn new(inner: ByteStream, expected: Digest) -> Self {
        Self {
            inner,
            verifier: Verifier::new(expected.algorithm()),
            expected,
            done: false,
        }
    }
}

impl Stream for VerifyingStream {
    type Item = Result<Bytes, StorageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.verifier.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.verifier.verify(&self.expected) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(StorageError::DigestMismatch {
                        expected: self.expected.to_string(),
                        actual: self.verifier.digest().to_string(),
                    })))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;
    use futures::StreamExt;
    use wharf_storage::MemoryDriver;

    fn store(verify_on_read: bool) -> BlobStore {
        BlobStore::new(Arc::new(MemoryDriver::new()), verify_on_read)
    }

    async fn collect(mut stream: ByteStream) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_put_then_open_roundtrip() {
        let store = store(false);
        let digest = digest_of(Algorithm::Sha256, b"layer bytes");

        store.put(&digest, Bytes::from("layer bytes")).await.unwrap();

        assert_eq!(store.stat(&digest).await.unwrap(), Some(11));
        let (stream, size) = store.open(&digest).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(collect(stream).await.unwrap(), b"layer bytes");
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_digest() {
        let store = store(false);
        let digest = digest_of(Algorithm::Sha256, b"expected");

        let err = store.put(&digest, Bytes::from("actual")).await.unwrap_err();
        assert!(matches!(err, BlobError::Digest(DigestError::Mismatch { .. })));
        assert_eq!(store.stat(&digest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_missing_blob() {
        let store = store(false);
        let digest = digest_of(Algorithm::Sha256, b"nope");

        match store.open(&digest).await {
            Err(BlobError::Unknown(_)) => {}
            Err(e) => panic!("expected BlobError::Unknown, got {e:?}"),
            Ok(_) => panic!("expected BlobError::Unknown, got Ok"),
        }
    }

    #[tokio::test]
    async fn test_verify_on_read_catches_corruption() {
        let driver = Arc::new(MemoryDriver::new());
        let store = BlobStore::new(driver.clone(), true);
        let digest = digest_of(Algorithm::Sha256, b"good bytes");

        store.put(&digest, Bytes::from("good bytes")).await.unwrap();

        // Clean read passes
        let (stream, _) = store.open(&digest).await.unwrap();
        assert!(collect(stream).await.is_ok());

        // Corrupt the stored bytes behind the store's back
        driver
            .put(&paths::blob_data(&digest), Bytes::from("bad bytes!"))
            .await
            .unwrap();

        let (stream, _) = store.open(&digest).await.unwrap();
        let err = collect(stream).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_adopt_staged_moves_bytes() {
        let driver = Arc::new(MemoryDriver::new());
        let store = BlobStore::new(driver.clone(), false);
        let digest = digest_of(Algorithm::Sha256, b"staged");

        driver.put("staging/data", Bytes::from("staged")).await.unwrap();
        let descriptor = store.adopt_staged("staging/data", &digest, 6).await.unwrap();

        assert_eq!(descriptor.size, 6);
        assert!(!driver.exists("staging/data").await.unwrap());
        assert_eq!(store.stat(&digest).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_adopt_staged_is_idempotent_at_content_level() {
        let driver = Arc::new(MemoryDriver::new());
        let store = BlobStore::new(driver.clone(), false);
        let digest = digest_of(Algorithm::Sha256, b"same");

        store.put(&digest, Bytes::from("same")).await.unwrap();

        // A second push of identical content drops the staged copy
        driver.put("staging/data", Bytes::from("same")).await.unwrap();
        store.adopt_staged("staging/data", &digest, 4).await.unwrap();

        assert!(!driver.exists("staging/data").await.unwrap());
        assert_eq!(store.stat(&digest).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store(false);
        let digest = digest_of(Algorithm::Sha256, b"doomed");

        store.put(&digest, Bytes::from("doomed")).await.unwrap();
        store.delete(&digest).await.unwrap();
        assert_eq!(store.stat(&digest).await.unwrap(), None);

        assert!(matches!(
            store.delete(&digest).await.unwrap_err(),
            BlobError::Unknown(_)
        ));
    }
}
