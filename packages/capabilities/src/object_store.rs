//! Object store capability contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::error::Result;

/// Metadata recorded per stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Hex-encoded sha256 of the stored bytes
    pub checksum: Option<String>,
}

/// Bucketed blob storage. Size limits are enforced at this boundary: a put
/// larger than the driver's configured maximum is a validation error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, ctx: &OpContext, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Idempotent: deleting an absent object succeeds
    async fn delete(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<()>;

    async fn exists(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<bool>;

    async fn get_metadata(&self, ctx: &OpContext, bucket: &str, key: &str)
        -> Result<ObjectMetadata>;

    async fn set_ttl(&self, ctx: &OpContext, bucket: &str, key: &str, ttl: Duration) -> Result<()>;
}
