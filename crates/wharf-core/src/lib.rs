//! Wharf Registry Core
//!
//! This crate provides the core of the Wharf registry: digest
//! computation and verification, the content-addressed blob store, the
//! resumable upload session manager, the manifest verification and
//! linking pipeline, and the repository namespace.

pub mod blobs;
pub mod digest;
pub mod jws;
pub mod manifest;
pub mod paths;
pub mod repository;
pub mod tarsum;
pub mod token;
pub mod uploads;

pub use blobs::{BlobError, BlobStore, Descriptor};
pub use digest::{Algorithm, Digest, DigestError, Verifier};
pub use manifest::{ManifestError, ManifestRef, ManifestService, Rejection};
pub use repository::{NameError, Namespace, TagError, validate_name, validate_tag};
pub use token::UploadState;
pub use uploads::{StartedUpload, UploadError, UploadManager, spawn_expiry_sweeper};
