//! Repository namespace
//!
//! Enforces the repository name and tag grammars and provides the
//! per-repository views: tag lists, repository existence, and the
//! cross-repository catalog.

use std::sync::Arc;
use thiserror::Error;
use wharf_storage::StorageDriver;

use crate::manifest::ManifestError;
use crate::paths;

/// Maximum total length of a repository name
const MAX_NAME_LENGTH: usize = 255;
/// Maximum length of a tag
const MAX_TAG_LENGTH: usize = 128;

#[derive(Error, Debug)]
#[error("Invalid repository name: {0}")]
pub struct NameError(pub String);

#[derive(Error, Debug)]
#[error("Invalid tag: {0}")]
pub struct TagError(pub String);

/// Validate a repository name.
///
/// The grammar is slash-separated components, each one or more
/// lowercase alphanumeric runs joined by single separators:
/// `[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*`
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(NameError(name.to_string()));
    }

    for component in name.split('/') {
        if !valid_component(component) {
            return Err(NameError(name.to_string()));
        }
    }
    Ok(())
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if bytes.is_empty() {
        return false;
    }

    let alphanumeric = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let separator = |b: u8| b == b'.' || b == b'_' || b == b'-';

    if !alphanumeric(bytes[0]) || !alphanumeric(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut prev_was_separator = false;
    for &b in bytes {
        if alphanumeric(b) {
            prev_was_separator = false;
        } else if separator(b) {
            // No doubled separators
            if prev_was_separator {
                return false;
            }
            prev_was_separator = true;
        } else {
            return false;
        }
    }
    true
}

/// Validate a tag: `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`
pub fn validate_tag(tag: &str) -> Result<(), TagError> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_TAG_LENGTH {
        return Err(TagError(tag.to_string()));
    }

    let first = bytes[0];
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return Err(TagError(tag.to_string()));
    }
    for &b in &bytes[1..] {
        if !(b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-') {
            return Err(TagError(tag.to_string()));
        }
    }
    Ok(())
}

/// Repository-level views over the storage driver
pub struct Namespace {
    driver: Arc<dyn StorageDriver>,
}

impl Namespace {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    /// A repository exists once it holds manifest metadata
    pub async fn exists(&self, name: &str) -> Result<bool, ManifestError> {
        Ok(self.driver.exists(&paths::manifests(name)).await?)
    }

    /// Sorted tag names of a repository. Errors with Unknown when the
    /// repository itself does not exist.
    pub async fn list_tags(&self, name: &str) -> Result<Vec<String>, ManifestError> {
        if !self.exists(name).await? {
            return Err(ManifestError::Unknown(name.to_string()));
        }
        // Driver listings are already sorted
        Ok(self.driver.list(&paths::tags(name)).await?)
    }

    /// Sorted names of every repository in the registry
    pub async fn catalog(&self) -> Result<Vec<String>, ManifestError> {
        let mut repositories = Vec::new();
        let mut stack = vec![String::new()];

        while let Some(dir) = stack.pop() {
            let prefix = if dir.is_empty() {
                "repositories".to_string()
            } else {
                format!("repositories/{}", dir)
            };
            let children = self.driver.list(&prefix).await?;

            if !dir.is_empty() && children.iter().any(|c| c == "_manifests") {
                repositories.push(dir.clone());
            }

            // Repository names nest, so descend past every
            // non-metadata child
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

        repositories.sort();
        Ok(repositories)
    }
}
