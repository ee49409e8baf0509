//! Wharf Storage Layer
//!
//! This crate provides the raw byte storage abstraction for Wharf,
//! keyed by opaque path strings. Local disk, in-memory, and
//! S3-compatible drivers are available.

pub mod driver;
pub mod error;
pub mod local;
pub mod memory;
pub mod s3;

pub use driver::{ByteStream, StorageDriver};
pub use error::StorageError;
pub use local::LocalDriver;
pub use memory::MemoryDriver;
pub use s3::{S3Config, S3Driver};
