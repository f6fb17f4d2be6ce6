//! Object storage capability.
//!
//! The enrichment worker receives its storage backend by injection rather
//! than reaching for a global client; failures surface through the worker's
//! error channel. Two backends ship: local filesystem for development and
//! tests, and S3 for production (presigned source uploads, multipart export
//! uploads, presigned export downloads).

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;

pub mod local;
pub mod s3;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object under `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Retrieve an object's content.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete an object; deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Presigned URL for uploading to `key`, valid for `ttl`.
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Presigned URL for downloading `key`, valid for `ttl`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}
