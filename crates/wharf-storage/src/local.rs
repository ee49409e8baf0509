//! Local disk storage driver

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::driver::{ByteStream, StorageDriver, check_path};
use crate::error::StorageError;

/// Local disk storage driver
///
/// Maps storage paths directly onto a directory tree below `base_path`.
pub struct LocalDriver {
    base_path: PathBuf,
}

impl LocalDriver {
    /// Create a new local storage driver
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;

        info!("Initialized local storage at {:?}", base_path);

        Ok(Self { base_path })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_path(path)?;
        Ok(self.base_path.join(path))
    }

    fn not_found(e: std::io::Error, path: &str) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let full = self.resolve(path)?;
        debug!("Reading {:?}", full);

        let data = fs::read(&full)
            .await
            .map_err(|e| Self::not_found(e, path))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        debug!("Writing {} bytes to {:?}", data.len(), full);

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using a temp file
        let temp_path = full.with_extension("tmp");
        fs::write(&temp_path, &data).await?;
        fs::rename(&temp_path, &full).await?;

        Ok(())
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        debug!("Appending {} bytes to {:?}", data.len(), full);

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&full)
            .await
            .map_err(|e| Self::not_found(e, path))?;

        file.write_all(&data).await?;
        file.flush().await?;

        let metadata = fs::metadata(&full).await?;
        Ok(metadata.len())
    }

    async fn stat(&self, path: &str) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| Self::not_found(e, path))?;
        Ok(metadata.len())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        Ok(fs::metadata(&full).await.is_ok())
    }

    async fn reader(&self, path: &str) -> Result<ByteStream, StorageError> {
        let full = self.resolve(path)?;
        debug!("Streaming {:?}", full);

        let file = File::open(&full)
            .await
            .map_err(|e| Self::not_found(e, path))?;

        let reader = BufReader::new(file);
        let stream = tokio_util::io::ReaderStream::new(reader);

        Ok(Box::pin(stream.map(|result| result.map_err(StorageError::Io))))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        debug!("Renaming {:?} -> {:?}", src, dst);

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&src, &dst)
            .await
            .map_err(|e| Self::not_found(e, from))?;
        Ok(())
    }

    async fn truncate(&self, path: &str, len: u64) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        debug!("Truncating {:?} to {} bytes", full, len);

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| Self::not_found(e, path))?;
        file.set_len(len).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        debug!("Deleting {:?}", full);

        match fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let full = self.resolve(prefix)?;
        debug!("Deleting tree {:?}", full);

        match fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(prefix)?;

        let mut entries = match fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn driver() -> (tempfile::TempDir, LocalDriver) {
        let tmp = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(tmp.path()).await.unwrap();
        (tmp, driver)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_tmp, driver) = driver().await;

        driver
            .put("blobs/sha256/ab/abcd/data", Bytes::from("hello"))
            .await
            .unwrap();

        let data = driver.get("blobs/sha256/ab/abcd/data").await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(driver.stat("blobs/sha256/ab/abcd/data").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_tmp, driver) = driver().await;

        let err = driver.get("blobs/missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_and_truncate() {
        let (_tmp, driver) = driver().await;

        driver.put("uploads/x/data", Bytes::new()).await.unwrap();
        assert_eq!(
            driver
                .append("uploads/x/data", Bytes::from("hello "))
                .await
                .unwrap(),
            6
        );
        assert_eq!(
            driver
                .append("uploads/x/data", Bytes::from("world"))
                .await
                .unwrap(),
            11
        );

        driver.truncate("uploads/x/data", 5).await.unwrap();
        assert_eq!(&driver.get("uploads/x/data").await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_rename_creates_parents() {
        let (_tmp, driver) = driver().await;

        driver.put("uploads/x/data", Bytes::from("abc")).await.unwrap();
        driver
            .rename("uploads/x/data", "blobs/sha256/aa/aabb/data")
            .await
            .unwrap();

        assert!(!driver.exists("uploads/x/data").await.unwrap());
        assert_eq!(
            &driver.get("blobs/sha256/aa/aabb/data").await.unwrap()[..],
            b"abc"
        );
    }

    #[tokio::test]
    async fn test_list_returns_sorted_children() {
        let (_tmp, driver) = driver().await;

        driver.put("tags/b/link", Bytes::from("x")).await.unwrap();
        driver.put("tags/a/link", Bytes::from("y")).await.unwrap();

        assert_eq!(driver.list("tags").await.unwrap(), vec!["a", "b"]);
        assert!(driver.list("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix_is_idempotent() {
        let (_tmp, driver) = driver().await;

        driver.put("uploads/x/data", Bytes::from("abc")).await.unwrap();
        driver.delete_prefix("uploads/x").await.unwrap();
        driver.delete_prefix("uploads/x").await.unwrap();
        assert!(!driver.exists("uploads/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_streams_content() {
        let (_tmp, driver) = driver().await;

        driver.put("blobs/data", Bytes::from("streamed")).await.unwrap();

        let mut stream = driver.reader("blobs/data").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"streamed");
    }
}
