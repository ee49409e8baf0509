//! In-memory storage driver
//!
//! Backs the `memory` storage backend and most of the test suite.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::driver::{ByteStream, StorageDriver, check_path};
use crate::error::StorageError;

/// In-memory storage driver
///
/// Content lives in an ordered map keyed by full path, so prefix listing
/// is a range scan.
#[derive(Default)]
pub struct MemoryDriver {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    /// Create a new empty in-memory driver
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        check_path(path)?;
        self.entries
            .read()
            .get(path)
            .map(|v| Bytes::from(v.clone()))
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        check_path(path)?;
        self.entries.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        check_path(path)?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        entry.extend_from_slice(&data);
        Ok(entry.len() as u64)
    }

    async fn stat(&self, path: &str) -> Result<u64, StorageError> {
        check_path(path)?;
        self.entries
            .read()
            .get(path)
            .map(|v| v.len() as u64)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        check_path(path)?;
        let entries = self.entries.read();
        if entries.contains_key(path) {
            return Ok(true);
        }
        let dir = format!("{}/", path);
        Ok(entries.range(dir.clone()..).next().is_some_and(|(k, _)| k.starts_with(&dir)))
    }

    async fn reader(&self, path: &str) -> Result<ByteStream, StorageError> {
        let data = self.get(path).await?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(data)])))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        check_path(from)?;
        check_path(to)?;
        let mut entries = self.entries.write();
        let data = entries
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        entries.insert(to.to_string(), data);
        Ok(())
    }

    async fn truncate(&self, path: &str, len: u64) -> Result<(), StorageError> {
        check_path(path)?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        entry.truncate(len as usize);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        check_path(path)?;
        Ok(self.entries.write().remove(path).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        check_path(prefix)?;
        let dir = format!("{}/", prefix);
        let mut entries = self.entries.write();
        entries.remove(prefix);
        let keys: Vec<String> = entries
            .range(dir.clone()..)
            .take_while(|(k, _)| k.starts_with(&dir))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        check_path(prefix)?;
        let dir = format!("{}/", prefix);
        let entries = self.entries.read();
        let mut names: Vec<String> = Vec::new();
        for (key, _) in entries.range(dir.clone()..) {
            let Some(rest) = key.strip_prefix(&dir) else {
                break;
            };
            let name = rest.split('/').next().unwrap_or(rest).to_string();
            if names.last() != Some(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_append() {
        let driver = MemoryDriver::new();

        driver.put("a/b", Bytes::from("he")).await.unwrap();
        assert_eq!(driver.append("a/b", Bytes::from("llo")).await.unwrap(), 5);
        assert_eq!(&driver.get("a/b").await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_exists_treats_prefixes_as_directories() {
        let driver = MemoryDriver::new();

        driver.put("repo/foo/_manifests/tags/v1/current/link", Bytes::from("d")).await.unwrap();
        assert!(driver.exists("repo/foo/_manifests").await.unwrap());
        assert!(!driver.exists("repo/bar/_manifests").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_dedups_child_names() {
        let driver = MemoryDriver::new();

        driver.put("tags/v1/current/link", Bytes::from("a")).await.unwrap();
        driver.put("tags/v1/index/x", Bytes::from("b")).await.unwrap();
        driver.put("tags/v2/current/link", Bytes::from("c")).await.unwrap();

        assert_eq!(driver.list("tags").await.unwrap(), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_subtree() {
        let driver = MemoryDriver::new();

        driver.put("uploads/x/data", Bytes::from("a")).await.unwrap();
        driver.put("uploads/x/startedat", Bytes::from("b")).await.unwrap();
        driver.put("uploads/y/data", Bytes::from("c")).await.unwrap();

        driver.delete_prefix("uploads/x").await.unwrap();
        assert!(!driver.exists("uploads/x").await.unwrap());
        assert!(driver.exists("uploads/y").await.unwrap());
    }
}
