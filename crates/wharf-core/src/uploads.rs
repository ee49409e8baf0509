//! Resumable blob upload sessions
//!
//! A session spans many requests, potentially from different
//! connections, and survives process restarts: the authoritative state
//! (staged bytes, start time, durably-hashed offset) lives in the
//! storage driver under the repository's `_uploads` namespace. The
//! in-process registry only caches the running hasher and provides the
//! per-session lock that serializes writers.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wharf_storage::{ByteStream, StorageDriver, StorageError};

use crate::blobs::{BlobError, BlobStore, Descriptor};
use crate::digest::{Algorithm, Digest, DigestError, Verifier, constant_time_eq};
use crate::paths;
use crate::token::{self, TokenError, UploadState};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Blob upload unknown: {0}")]
    Unknown(String),

    #[error("Invalid chunk offset: upload is at {expected}")]
    InvalidOffset { expected: u64 },

    #[error("Invalid upload state token: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<TokenError> for UploadError {
    fn from(e: TokenError) -> Self {
        UploadError::InvalidToken(e.to_string())
    }
}

/// Durable record of how far the streaming hash has progressed.
///
/// The hash library exposes no serializable state, so only the offset is
/// persisted; a cold resume rebuilds the hasher by re-reading the staged
/// bytes up to this offset.
#[derive(Debug, Serialize, Deserialize)]
struct HashState {
    algorithm: String,
    offset: u64,
}

/// An in-flight upload session.
///
/// Invariants: `offset` equals the number of durably hashed bytes in the
/// staging file, and `hasher` has consumed exactly those bytes.
#[derive(Debug)]
pub struct UploadSession {
    pub repository: String,
    pub uuid: String,
    pub offset: u64,
    pub started_at: DateTime<Utc>,
    hasher: Verifier,
}

/// Result of initiating an upload
#[derive(Debug, Clone)]
pub struct StartedUpload {
    pub uuid: String,
    pub token: String,
}

fn session_key(repository: &str, uuid: &str) -> String {
    format!("{}/{}", repository, uuid)
}

fn normalize_uuid(raw: &str) -> Result<String, UploadError> {
    Uuid::parse_str(raw)
        .map(|u| u.to_string())
        .map_err(|_| UploadError::Unknown(raw.to_string()))
}

/// Tracks in-flight uploads and drives them through their lifecycle:
/// create, chunked writes, commit or cancel, and background expiry.
pub struct UploadManager {
    driver: Arc<dyn StorageDriver>,
    blobs: Arc<BlobStore>,
    secret: Vec<u8>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UploadSession>>>>,
}

impl UploadManager {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        blobs: Arc<BlobStore>,
        secret: impl Into<Vec<u8>>,
        ttl_hours: i64,
    ) -> Self {
        Self {
            driver,
            blobs,
            secret: secret.into(),
            ttl: Duration::hours(ttl_hours),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new upload session in a repository
    pub async fn create(&self, repository: &str) -> Result<StartedUpload, UploadError> {
        let uuid = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        self.driver
            .put(&paths::upload_data(repository, &uuid), Bytes::new())
            .await?;
        self.driver
            .put(
                &paths::upload_startedat(repository, &uuid),
                Bytes::from(started_at.to_rfc3339()),
            )
            .await?;

        let session = UploadSession {
            repository: repository.to_string(),
            uuid: uuid.clone(),
            offset: 0,
            started_at,
            hasher: Verifier::new(Algorithm::Sha256),
        };
        self.persist_hashstate(&session).await?;

        let token = self.issue_token(&session);
        self.sessions.lock().insert(
            session_key(repository, &uuid),
            Arc::new(tokio::sync::Mutex::new(session)),
        );

        info!("Started upload session {} for {}", uuid, repository);
        Ok(StartedUpload { uuid, token })
    }

    /// Emit a fresh upload-state token for a session
    pub fn issue_token(&self, session: &UploadSession) -> String {
        token::pack(
            &UploadState {
                name: session.repository.clone(),
                uuid: session.uuid.clone(),
                offset: session.offset,
                started_at: session.started_at.to_rfc3339(),
            },
            &self.secret,
        )
    }

    /// Validate a token against the upload URL it arrived on.
    ///
    /// The MAC must verify before any field is trusted; the embedded
    /// repository and session ID must match the URL. The embedded offset
    /// is advisory only.
    pub fn verify_token(
        &self,
        raw: &str,
        repository: &str,
        uuid: &str,
    ) -> Result<UploadState, UploadError> {
        let state = token::unpack(raw, &self.secret)?;
        if state.name != repository || state.uuid != uuid {
            return Err(UploadError::InvalidToken(
                "token does not match upload URL".to_string(),
            ));
        }
        Ok(state)
    }

    /// Load a session, rebuilding in-process state if this process has
    /// not seen it before. Returns a handle whose lock serializes all
    /// writers for the session.
    pub async fn resume(
        &self,
        repository: &str,
        uuid: &str,
    ) -> Result<Arc<tokio::sync::Mutex<UploadSession>>, UploadError> {
        let uuid = normalize_uuid(uuid)?;
        let key = session_key(repository, &uuid);

        if let Some(handle) = self.sessions.lock().get(&key) {
            return Ok(handle.clone());
        }

        let session = self.load_session(repository, &uuid).await?;

        let mut sessions = self.sessions.lock();
        let handle = sessions
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(session)))
            .clone();
        Ok(handle)
    }

    async fn load_session(
        &self,
        repository: &str,
        uuid: &str,
    ) -> Result<UploadSession, UploadError> {
        let not_found = |e: StorageError| match e {
            StorageError::NotFound(_) => UploadError::Unknown(uuid.to_string()),
            e => UploadError::Storage(e),
        };

        let raw = self
            .driver
            .get(&paths::upload_startedat(repository, uuid))
            .await
            .map_err(not_found)?;
        let started_at = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                StorageError::Backend(format!("corrupt startedat for upload {}", uuid))
            })?;

        let raw = self
            .driver
            .get(&paths::upload_hashstate(repository, uuid))
            .await
            .map_err(not_found)?;
        let state: HashState = serde_json::from_slice(&raw).map_err(|_| {
            StorageError::Backend(format!("corrupt hashstate for upload {}", uuid))
        })?;
        let algorithm: Algorithm = state.algorithm.parse()?;

        let data_path = paths::upload_data(repository, uuid);
        let data_len = self.driver.stat(&data_path).await.map_err(not_found)?;
        let offset = if data_len > state.offset {
            // A chunk was partially appended but never recorded; make it
            // indistinguishable from one that never arrived.
            warn!(
                "Upload {} has {} staged bytes beyond the recorded offset {}, discarding",
                uuid,
                data_len - state.offset,
                state.offset
            );
            self.driver.truncate(&data_path, state.offset).await?;
            state.offset
        } else if data_len < state.offset {
            warn!(
                "Upload {} staged data shorter than recorded offset ({} < {}), resuming from data",
                uuid, data_len, state.offset
            );
            data_len
        } else {
            state.offset
        };

        // Rebuild the streaming hash over the staged bytes
        let mut hasher = Verifier::new(algorithm);
        if offset > 0 {
            let mut stream = self.driver.reader(&data_path).await.map_err(not_found)?;
            while let Some(chunk) = stream.next().await {
                hasher.update(&chunk?);
            }
        }

        debug!("Resumed upload session {} at offset {}", uuid, offset);
        Ok(UploadSession {
            repository: repository.to_string(),
            uuid: uuid.to_string(),
            offset,
            started_at,
            hasher,
        })
    }

    /// Accept a chunk of bytes at the session's current offset.
    ///
    /// When the client asserts an offset (Content-Range), it must equal
    /// the session offset exactly; the server never advances past a gap.
    /// On an I/O error the session stays open at the last durable offset
    /// and the client may retry the chunk.
    pub async fn patch_chunk(
        &self,
        session: &mut UploadSession,
        asserted_offset: Option<u64>,
        mut chunk: ByteStream,
    ) -> Result<u64, UploadError> {
        if let Some(offset) = asserted_offset
            && offset != session.offset
        {
            return Err(UploadError::InvalidOffset {
                expected: session.offset,
            });
        }

        let data_path = paths::upload_data(&session.repository, &session.uuid);
        let not_found = |e: StorageError| match e {
            StorageError::NotFound(_) => UploadError::Unknown(session.uuid.clone()),
            e => UploadError::Storage(e),
        };

        // Discard any uncommitted tail left by an aborted chunk
        let data_len = self.driver.stat(&data_path).await.map_err(not_found)?;
        if data_len > session.offset {
            self.driver.truncate(&data_path, session.offset).await?;
        }

        while let Some(piece) = chunk.next().await {
            let piece = piece?;
            self.driver.append(&data_path, piece.clone()).await?;
            session.hasher.update(&piece);
            session.offset += piece.len() as u64;
        }

        self.persist_hashstate(session).await?;
        debug!(
            "Upload {} advanced to offset {}",
            session.uuid, session.offset
        );
        Ok(session.offset)
    }

    /// Finalize an upload against a client-asserted digest.
    ///
    /// On mismatch the session stays fully recoverable: the staged bytes
    /// and hash state are untouched and the client may re-PUT with a
    /// corrected digest without re-uploading.
    pub async fn commit(
        &self,
        session: &mut UploadSession,
        asserted: &Digest,
    ) -> Result<Descriptor, UploadError> {
        let computed = if asserted.algorithm() == Algorithm::Sha256 {
            session.hasher.digest()
        } else {
            self.digest_staged(session, asserted.algorithm()).await?
        };

        if computed.algorithm() != asserted.algorithm()
            || !constant_time_eq(computed.hex().as_bytes(), asserted.hex().as_bytes())
        {
            return Err(UploadError::Digest(DigestError::Mismatch {
                expected: asserted.to_string(),
                actual: computed.to_string(),
            }));
        }

        let data_path = paths::upload_data(&session.repository, &session.uuid);
        let descriptor = self
            .blobs
            .adopt_staged(&data_path, asserted, session.offset)
            .await
            .map_err(|e| match e {
                BlobError::Storage(s) => UploadError::Storage(s),
                BlobError::Digest(d) => UploadError::Digest(d),
                BlobError::Unknown(u) => UploadError::Unknown(u),
            })?;

        self.driver
            .delete_prefix(&paths::upload(&session.repository, &session.uuid))
            .await?;
        self.sessions
            .lock()
            .remove(&session_key(&session.repository, &session.uuid));

        info!(
            "Committed upload {} as {} ({} bytes)",
            session.uuid, descriptor.digest, descriptor.size
        );
        Ok(descriptor)
    }

    async fn persist_hashstate(&self, session: &UploadSession) -> Result<(), UploadError> {
        let state = HashState {
            algorithm: session.hasher.algorithm().to_string(),
            offset: session.offset,
        };
        let raw = serde_json::to_vec(&state).expect("hash state serializes");
        self.driver
            .put(
                &paths::upload_hashstate(&session.repository, &session.uuid),
                Bytes::from(raw),
            )
            .await?;
        Ok(())
    }

    async fn digest_staged(
        &self,
        session: &UploadSession,
        algorithm: Algorithm,
    ) -> Result<Digest, UploadError> {
        let data_path = paths::upload_data(&session.repository, &session.uuid);
        let mut verifier = Verifier::new(algorithm);
        let mut stream = self.driver.reader(&data_path).await?;
        while let Some(chunk) = stream.next().await {
            verifier.update(&chunk?);
        }
        Ok(verifier.digest())
    }

    /// Abandon an upload and delete its staged state. Idempotent.
    pub async fn cancel(&self, session: &mut UploadSession) -> Result<(), UploadError> {
        self.driver
            .delete_prefix(&paths::upload(&session.repository, &session.uuid))
            .await?;
        self.sessions
            .lock()
            .remove(&session_key(&session.repository, &session.uuid));
        info!("Cancelled upload {}", session.uuid);
        Ok(())
    }

    /// Delete sessions older than the TTL. Sessions currently locked by
    /// a writer are skipped and picked up on a later pass.
    pub async fn sweep(&self) -> Result<usize, UploadError> {
        let mut expired = 0;
        let mut stack = vec![String::new()];

        while let Some(dir) = stack.pop() {
            let prefix = if dir.is_empty() {
                "repositories".to_string()
            } else {
                format!("repositories/{}", dir)
            };
            let children = self.driver.list(&prefix).await?;

            if !dir.is_empty() && children.iter().any(|c| c == "_uploads") {
                for uuid in self.driver.list(&format!("{}/_uploads", prefix)).await? {
                    if self.try_expire(&dir, &uuid).await? {
                        expired += 1;
                    }
                }
            }

            for child in children {
                if !child.starts_with('_') {
                    stack.push(if dir.is_empty() {
                        child
                    } else {
                        format!("{}/{}", dir, child)
                    });
                }
            }
        }

        Ok(expired)
    }

    async fn try_expire(&self, repository: &str, uuid: &str) -> Result<bool, UploadError> {
        let key = session_key(repository, uuid);
        let handle = self.sessions.lock().get(&key).cloned();

        // Never delete a session with an active writer
        let _guard = match &handle {
            Some(h) => match h.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => return Ok(false),
            },
            None => None,
        };

        let expired = match self
            .driver
            .get(&paths::upload_startedat(repository, uuid))
            .await
        {
            Ok(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| Utc::now().signed_duration_since(t.with_timezone(&Utc)) > self.ttl)
                // Unreadable start time: treat as an orphan
                .unwrap_or(true),
            Err(StorageError::NotFound(_)) => true,
            Err(e) => return Err(UploadError::Storage(e)),
        };

        if !expired {
            return Ok(false);
        }

        self.driver
            .delete_prefix(&paths::upload(repository, uuid))
            .await?;
        self.sessions.lock().remove(&key);
        info!("Expired upload session {} in {}", uuid, repository);
        Ok(true)
    }
}

/// Spawn the background sweeper that expires stale upload sessions
pub fn spawn_expiry_sweeper(
    manager: Arc<UploadManager>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    use tokio::time::{Duration, interval};

    info!(
        "Starting upload expiry sweeper (interval: {} seconds)",
        interval_secs
    );

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match manager.sweep().await {
                Ok(expired) => {
                    if expired > 0 {
                        info!("Upload sweep expired {} sessions", expired);
                    }
                }
                Err(e) => {
                    warn!("Error during upload sweep: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_of;
    use wharf_storage::MemoryDriver;

    fn manager_on(driver: Arc<MemoryDriver>, ttl_hours: i64) -> UploadManager {
        let blobs = Arc::new(BlobStore::new(driver.clone(), false));
        UploadManager::new(driver, blobs, b"test-secret".to_vec(), ttl_hours)
    }

    fn chunk(data: &[u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::copy_from_slice(data))]))
    }

    #[tokio::test]
    async fn test_chunked_upload_commits() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver.clone(), 24);

        let started = manager.create("foo/bar").await.unwrap();
        let handle = manager.resume("foo/bar", &started.uuid).await.unwrap();
        let mut session = handle.lock().await;

        assert_eq!(
            manager.patch_chunk(&mut session, Some(0), chunk(b"hello ")).await.unwrap(),
            6
        );
        assert_eq!(
            manager.patch_chunk(&mut session, Some(6), chunk(b"world")).await.unwrap(),
            11
        );

        let digest = digest_of(Algorithm::Sha256, b"hello world");
        let descriptor = manager.commit(&mut session, &digest).await.unwrap();
        assert_eq!(descriptor.size, 11);

        // Session state is gone, blob is present
        assert!(!driver.exists(&paths::upload("foo/bar", &started.uuid)).await.unwrap());
        assert!(driver.exists(&paths::blob_data(&digest)).await.unwrap());
    }

    #[tokio::test]
    async fn test_offset_gap_is_rejected() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver, 24);

        let started = manager.create("foo").await.unwrap();
        let handle = manager.resume("foo", &started.uuid).await.unwrap();
        let mut session = handle.lock().await;

        manager.patch_chunk(&mut session, Some(0), chunk(b"12345")).await.unwrap();

        let err = manager
            .patch_chunk(&mut session, Some(99), chunk(b"xx"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidOffset { expected: 5 }));
        assert_eq!(session.offset, 5);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_session_recoverable() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver, 24);

        let started = manager.create("foo").await.unwrap();
        let handle = manager.resume("foo", &started.uuid).await.unwrap();
        let mut session = handle.lock().await;

        manager.patch_chunk(&mut session, Some(0), chunk(b"hello")).await.unwrap();

        let wrong = digest_of(Algorithm::Sha256, b"not hello");
        let err = manager.commit(&mut session, &wrong).await.unwrap_err();
        assert!(matches!(err, UploadError::Digest(DigestError::Mismatch { .. })));

        // Bytes and hash state are intact; the corrected digest commits
        let right = digest_of(Algorithm::Sha256, b"hello");
        manager.commit(&mut session, &right).await.unwrap();
    }

    #[tokio::test]
    async fn test_cold_resume_rebuilds_hasher() {
        let driver = Arc::new(MemoryDriver::new());
        let first = manager_on(driver.clone(), 24);

        let started = first.create("foo").await.unwrap();
        {
            let handle = first.resume("foo", &started.uuid).await.unwrap();
            let mut session = handle.lock().await;
            first.patch_chunk(&mut session, Some(0), chunk(b"hello ")).await.unwrap();
        }

        // A fresh manager on the same driver stands in for a restarted process
        let second = manager_on(driver, 24);
        let handle = second.resume("foo", &started.uuid).await.unwrap();
        let mut session = handle.lock().await;
        assert_eq!(session.offset, 6);

        second.patch_chunk(&mut session, Some(6), chunk(b"world")).await.unwrap();

        let digest = digest_of(Algorithm::Sha256, b"hello world");
        second.commit(&mut session, &digest).await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_discards_uncommitted_tail() {
        let driver = Arc::new(MemoryDriver::new());
        let first = manager_on(driver.clone(), 24);

        let started = first.create("foo").await.unwrap();
        {
            let handle = first.resume("foo", &started.uuid).await.unwrap();
            let mut session = handle.lock().await;
            first.patch_chunk(&mut session, Some(0), chunk(b"hello")).await.unwrap();
        }

        // Simulate a crash mid-append: bytes landed, offset never advanced
        driver
            .append(&paths::upload_data("foo", &started.uuid), Bytes::from("junk"))
            .await
            .unwrap();

        let second = manager_on(driver.clone(), 24);
        let handle = second.resume("foo", &started.uuid).await.unwrap();
        let mut session = handle.lock().await;
        assert_eq!(session.offset, 5);
        assert_eq!(
            driver.stat(&paths::upload_data("foo", &started.uuid)).await.unwrap(),
            5
        );

        second
            .commit(&mut session, &digest_of(Algorithm::Sha256, b"hello"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_unknown_session() {
        let manager = manager_on(Arc::new(MemoryDriver::new()), 24);

        let err = manager
            .resume("foo", "550e8400-e29b-41d4-a716-446655440000")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Unknown(_)));

        let err = manager.resume("foo", "not-a-uuid").await.unwrap_err();
        assert!(matches!(err, UploadError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_resume_is_unknown() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver, 24);

        let started = manager.create("foo").await.unwrap();
        {
            let handle = manager.resume("foo", &started.uuid).await.unwrap();
            let mut session = handle.lock().await;
            manager.cancel(&mut session).await.unwrap();
            // Idempotent
            manager.cancel(&mut session).await.unwrap();
        }

        let err = manager.resume("foo", &started.uuid).await.unwrap_err();
        assert!(matches!(err, UploadError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_token_roundtrip_and_url_binding() {
        let manager = manager_on(Arc::new(MemoryDriver::new()), 24);

        let started = manager.create("foo").await.unwrap();
        let state = manager
            .verify_token(&started.token, "foo", &started.uuid)
            .unwrap();
        assert_eq!(state.offset, 0);

        let err = manager
            .verify_token(&started.token, "other-repo", &started.uuid)
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_sessions() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver.clone(), 0);

        let started = manager.create("foo/bar").await.unwrap();
        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert!(!driver.exists(&paths::upload("foo/bar", &started.uuid)).await.unwrap());

        let err = manager.resume("foo/bar", &started.uuid).await.unwrap_err();
        assert!(matches!(err, UploadError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_sweep_skips_sessions_with_active_writer() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver.clone(), 0);

        let started = manager.create("foo").await.unwrap();
        let handle = manager.resume("foo", &started.uuid).await.unwrap();
        let _writer = handle.lock().await;

        assert_eq!(manager.sweep().await.unwrap(), 0);
        assert!(driver.exists(&paths::upload("foo", &started.uuid)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_sessions_survive_sweep() {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager_on(driver.clone(), 24);

        let started = manager.create("foo").await.unwrap();
        assert_eq!(manager.sweep().await.unwrap(), 0);
        assert!(driver.exists(&paths::upload("foo", &started.uuid)).await.unwrap());
    }
}
