//! Key/value capability contracts.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::Result;

/// Minimum scan batch size drivers must support
pub const MIN_SCAN_BATCH: usize = 100;

/// One page of a cursor-based key scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Opaque cursor for the next page; `None` when the scan is complete
    pub cursor: Option<String>,
}

/// One page of a cursor-based key+value scan
#[derive(Debug, Clone, Default)]
pub struct ScanValuesPage {
    pub entries: Vec<(String, Vec<u8>)>,
    pub cursor: Option<String>,
}

/// Basic key/value operations with optional per-key TTL.
///
/// Drivers that advertise `Capability::KeyValueTtl` honor the `ttl`
/// argument; others reject it with a validation error.
#[async_trait]
pub trait KeyValueBasic: Send + Sync {
    async fn set(
        &self,
        ctx: &OpContext,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn get(&self, ctx: &OpContext, key: &str) -> Result<Option<Vec<u8>>>;

    /// Idempotent: deleting an absent key succeeds
    async fn delete(&self, ctx: &OpContext, key: &str) -> Result<()>;

    async fn exists(&self, ctx: &OpContext, key: &str) -> Result<bool>;
}

/// Prefix scan over the keyspace, cursor-based
#[async_trait]
pub trait KeyValueScan: Send + Sync {
    async fn scan(
        &self,
        ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage>;

    async fn scan_with_values(
        &self,
        ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanValuesPage>;
}
