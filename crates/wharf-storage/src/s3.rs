//! S3-compatible storage driver
//!
//! Uses the `object_store` crate to provide S3-compatible storage for
//! Wharf. Supports AWS S3, MinIO, and other S3-compatible services.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::driver::{ByteStream, StorageDriver, check_path};
use crate::error::StorageError;

/// Connection settings for an S3-compatible bucket.
///
/// Credentials are all-or-nothing: either both keys are set, or neither
/// and the ambient AWS environment is used.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint, for MinIO and other S3-compatible services
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix every registry path is nested under
    pub prefix: Option<String>,
    /// Permit plain-HTTP endpoints (local development only)
    pub allow_http: bool,
}

/// S3 storage driver
///
/// S3 has no append or rename; `append` is read-concat-put and `rename`
/// is copy-then-delete. The digest-addressed destinations the registry
/// uses make a repeated copy harmless after a crash.
#[derive(Debug)]
pub struct S3Driver {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl S3Driver {
    /// Connect to the configured bucket
    pub async fn new(config: S3Config) -> Result<Self, StorageError> {
        let S3Config {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            prefix,
            allow_http,
        } = config;

        if bucket.is_empty() {
            return Err(StorageError::Configuration(
                "S3 bucket name must not be empty".to_string(),
            ));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&region)
            .with_allow_http(allow_http);
        if let Some(endpoint) = &endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        match (&access_key_id, &secret_access_key) {
            (Some(key), Some(secret)) => {
                builder = builder.with_access_key_id(key).with_secret_access_key(secret);
            }
            // No explicit credentials: the builder falls back to the
            // ambient AWS environment
            (None, None) => {}
            _ => {
                return Err(StorageError::Configuration(
                    "S3 credentials require both access_key and secret_key".to_string(),
                ));
            }
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Configuration(format!("S3 driver setup failed: {}", e)))?;

        // Normalize the prefix so object_path can always join with '/'
        let prefix = prefix
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();

        info!(
            bucket = %bucket,
            region = %region,
            prefix = %prefix,
            "Initialized S3 storage driver"
        );

        Ok(Self {
            store: Arc::new(store),
            prefix,
        })
    }

    fn object_path(&self, path: &str) -> Result<ObjectPath, StorageError> {
        check_path(path)?;
        let full = if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        };
        ObjectPath::parse(&full).map_err(|e| StorageError::InvalidPath(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let object = self.object_path(path)?;
        debug!("Reading from S3: {:?}", object);

        let result = self.store.get(&object).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        result
            .bytes()
            .await
            .map_err(|e| StorageError::S3(format!("Failed to read bytes: {}", e)))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let object = self.object_path(path)?;
        debug!("Writing {} bytes to S3: {:?}", data.len(), object);

        self.store
            .put(&object, PutPayload::from(data))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(())
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        let object = self.object_path(path)?;
        debug!("Appending {} bytes to S3: {:?}", data.len(), object);

        // S3 has no append; read back, concatenate, and write again
        let existing = match self.store.get(&object).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| StorageError::S3(format!("Failed to read existing data: {}", e)))?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(StorageError::S3(e.to_string())),
        };

        let mut combined = existing.to_vec();
        combined.extend_from_slice(&data);
        let new_size = combined.len() as u64;

        self.store
            .put(&object, PutPayload::from(Bytes::from(combined)))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(new_size)
    }

    async fn stat(&self, path: &str) -> Result<u64, StorageError> {
        let object = self.object_path(path)?;

        let meta = self.store.head(&object).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        Ok(meta.size as u64)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let object = self.object_path(path)?;

        match self.store.head(&object).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(StorageError::S3(e.to_string())),
        }

        // Fall back to a prefix probe for directory-like paths
        let listing = self
            .store
            .list_with_delimiter(Some(&object))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn reader(&self, path: &str) -> Result<ByteStream, StorageError> {
        let object = self.object_path(path)?;
        debug!("Streaming from S3: {:?}", object);

        let result = self.store.get(&object).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        let stream = result
            .into_stream()
            .map_err(|e| StorageError::S3(format!("Stream error: {}", e)));

        Ok(Box::pin(stream))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        debug!("Copying S3 object {:?} -> {:?}", src, dst);

        self.store.copy(&src, &dst).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(from.to_string()),
            _ => StorageError::S3(e.to_string()),
        })?;

        if let Err(e) = self.store.delete(&src).await {
            warn!("Failed to delete S3 source after copy (path: {:?}): {}", src, e);
        }
        Ok(())
    }

    async fn truncate(&self, path: &str, len: u64) -> Result<(), StorageError> {
        let data = self.get(path).await?;
        let truncated = data.slice(..(len as usize).min(data.len()));
        self.put(path, truncated).await
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let object = self.object_path(path)?;
        debug!("Deleting from S3: {:?}", object);

        match self.store.delete(&object).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::S3(e.to_string())),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let object = self.object_path(prefix)?;
        debug!("Deleting S3 tree: {:?}", object);

        let mut listing = self.store.list(Some(&object));
        while let Some(meta) = listing
            .try_next()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?
        {
            match self.store.delete(&meta.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(StorageError::S3(e.to_string())),
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let object = self.object_path(prefix)?;

        let listing = self
            .store
            .list_with_delimiter(Some(&object))
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        let mut names: Vec<String> = Vec::new();
        for common in &listing.common_prefixes {
            if let Some(name) = common.filename() {
                names.push(name.to_string());
            }
        }
        for meta in &listing.objects {
            if let Some(name) = meta.location.filename() {
                names.push(name.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
