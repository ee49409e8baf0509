//! Storage driver trait

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::error::StorageError;

/// Type alias for a boxed stream of bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Storage driver trait
///
/// Implementations of this trait store raw byte content keyed by opaque,
/// slash-separated path strings. Paths are generated internally by the
/// registry core and never come from clients directly.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Read the content at a path fully into memory
    async fn get(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Write content at a path, replacing anything already there.
    ///
    /// The write is atomic: readers observe either the old content or the
    /// new content, never a partial write.
    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError>;

    /// Append content to a path, returning the new total length.
    /// The path must already exist.
    async fn append(&self, path: &str, data: Bytes) -> Result<u64, StorageError>;

    /// Get the length of the content at a path
    async fn stat(&self, path: &str) -> Result<u64, StorageError>;

    /// Check whether a path (or any path below it) exists
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Stream the content at a path
    async fn reader(&self, path: &str) -> Result<ByteStream, StorageError>;

    /// Move content from one path to another.
    ///
    /// Atomic where the backend allows a rename; copy-then-delete
    /// otherwise. The destination is digest-addressed by callers, so a
    /// repeated move onto the same destination is harmless.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Shorten the content at a path to `len` bytes
    async fn truncate(&self, path: &str, len: u64) -> Result<(), StorageError>;

    /// Delete the content at a path. Returns false if nothing was there.
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;

    /// Delete everything at or below a path prefix
    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;

    /// List the immediate child names below a path prefix.
    ///
    /// Returns an empty list when the prefix does not exist.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Reject path strings that could escape the storage root.
///
/// Core-generated paths never contain these, so a hit indicates a bug
/// upstream rather than client input.
pub fn check_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath("empty path".to_string()));
    }
    if path.starts_with('/') || path.contains('\0') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if path.split('/').any(|seg| seg == "." || seg == ".." || seg.is_empty()) {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
