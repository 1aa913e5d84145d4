//! Registry coordinator: identity records, TTL authority, enumeration.
//!
//! The registry backend (a TTL-capable key/value driver) is the authority
//! for expiry; the coordinator additionally elides records whose
//! `expires_at` has passed even when the backend has not reclaimed the key
//! yet. Enumeration pages through the keyspace with the backend's cursor
//! scan and applies the filter client-side, unless a native-filtering
//! enumerator has been supplied and has survived a correctness probe.

use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prism_capabilities::{
    KeyValueBasic, KeyValueScan, Metadata, OpContext, PrismError, Result, MIN_SCAN_BATCH,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filter::Filter;

/// Key prefix identities are stored under
pub const IDENTITY_PREFIX: &str = "identity:";

/// One registered identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub metadata: Metadata,
    pub registered_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_secs: Option<u64>,
}

impl IdentityRecord {
    pub fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Utc::now())
    }
}

/// Caps the coordinator enforces
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_identities: usize,
    pub max_metadata_entries: usize,
    pub max_filter_depth: usize,
    pub max_clauses: usize,
    pub default_ttl: Option<Duration>,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_identities: 10_000,
            max_metadata_entries: 64,
            max_filter_depth: 5,
            max_clauses: 32,
            default_ttl: None,
        }
    }
}

/// A registry backend with its own filtering engine. Pushdown is used only
/// after a probe confirms it agrees with the client-side evaluator.
#[async_trait]
pub trait NativeEnumerate: Send + Sync {
    async fn enumerate(&self, ctx: &OpContext, filter: Option<&Filter>)
        -> Result<Vec<IdentityRecord>>;
}

const PUSHDOWN_UNPROBED: u8 = 0;
const PUSHDOWN_VERIFIED: u8 = 1;
const PUSHDOWN_REJECTED: u8 = 2;

/// Backend-agnostic registry operations
pub struct RegistryCoordinator {
    kv: Arc<dyn KeyValueBasic>,
    scan: Option<Arc<dyn KeyValueScan>>,
    native: Option<Arc<dyn NativeEnumerate>>,
    pushdown_state: AtomicU8,
    limits: RegistryLimits,
}

impl RegistryCoordinator {
    pub fn new(
        kv: Arc<dyn KeyValueBasic>,
        scan: Option<Arc<dyn KeyValueScan>>,
        limits: RegistryLimits,
    ) -> Self {
        Self {
            kv,
            scan,
            native: None,
            pushdown_state: AtomicU8::new(PUSHDOWN_UNPROBED),
            limits,
        }
    }

    /// Offer a native-filtering enumerator for pushdown
    pub fn with_native(mut self, native: Arc<dyn NativeEnumerate>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    fn key(id: &str) -> String {
        format!("{IDENTITY_PREFIX}{id}")
    }

    /// Register or overwrite an identity. `ttl_secs` of zero means no
    /// expiry; `None` falls back to the configured default.
    pub async fn register(
        &self,
        ctx: &OpContext,
        id: &str,
        metadata: Metadata,
        ttl_secs: Option<u64>,
    ) -> Result<IdentityRecord> {
        if id.is_empty() {
            return Err(PrismError::validation("identity id must not be empty"));
        }
        if metadata.len() > self.limits.max_metadata_entries {
            return Err(PrismError::validation(format!(
                "metadata has {} entries, the limit is {}",
                metadata.len(),
                self.limits.max_metadata_entries
            )));
        }

        // The cap applies to new identities; overwriting never counts.
        let key = Self::key(id);
        if self.kv.get(ctx, &key).await?.is_none() {
            let live = self.count(ctx).await?;
            if live >= self.limits.max_identities {
                return Err(PrismError::exhausted(
                    format!("registry holds {live} identities, the cap is {}",
                        self.limits.max_identities),
                    Some(Duration::from_secs(1)),
                ));
            }
        }

        let ttl = match ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.limits.default_ttl,
        };
        let now = Utc::now();
        let record = IdentityRecord {
            id: id.to_string(),
            metadata,
            registered_at: now,
            expires_at: ttl.and_then(|t| chrono::Duration::from_std(t).ok().map(|d| now + d)),
            ttl_secs: ttl.map(|t| t.as_secs()),
        };
        self.kv
            .set(ctx, &key, serde_json::to_vec(&record)?, ttl)
            .await?;
        debug!(id, ttl_secs = ?record.ttl_secs, "identity registered");
        Ok(record)
    }

    /// Idempotent removal
    pub async fn unregister(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.kv.delete(ctx, &Self::key(id)).await
    }

    pub async fn get(&self, ctx: &OpContext, id: &str) -> Result<IdentityRecord> {
        let raw = self
            .kv
            .get(ctx, &Self::key(id))
            .await?
            .ok_or_else(|| PrismError::not_found(format!("identity {id}")))?;
        let record: IdentityRecord = serde_json::from_slice(&raw)?;
        if record.expired() {
            // The backend has not reclaimed the key yet; callers never see it.
            return Err(PrismError::not_found(format!("identity {id}")));
        }
        Ok(record)
    }

    /// Live identities whose metadata satisfies `filter`
    pub async fn enumerate(
        &self,
        ctx: &OpContext,
        filter: Option<&Filter>,
    ) -> Result<Vec<IdentityRecord>> {
        if let Some(filter) = filter {
            filter.validate(self.limits.max_filter_depth, self.limits.max_clauses)?;
        }

        if let Some(native) = &self.native {
            match self.pushdown_state.load(AtomicOrdering::SeqCst) {
                PUSHDOWN_VERIFIED => {
                    let records = native.enumerate(ctx, filter).await?;
                    return Ok(records.into_iter().filter(|r| !r.expired()).collect());
                }
                PUSHDOWN_UNPROBED => {
                    // Probe once: pushdown must agree with the client-side
                    // evaluator before it is trusted.
                    let scanned = self.scan_and_filter(ctx, filter).await?;
                    match native.enumerate(ctx, filter).await {
                        Ok(pushed) => {
                            let mut a: Vec<&str> =
                                scanned.iter().map(|r| r.id.as_str()).collect();
                            let mut b: Vec<&str> = pushed
                                .iter()
                                .filter(|r| !r.expired())
                                .map(|r| r.id.as_str())
                                .collect();
                            a.sort_unstable();
                            b.sort_unstable();
                            let verdict = if a == b {
                                PUSHDOWN_VERIFIED
                            } else {
                                warn!("native enumerate disagrees with the evaluator, pushdown disabled");
                                PUSHDOWN_REJECTED
                            };
                            self.pushdown_state.store(verdict, AtomicOrdering::SeqCst);
                        }
                        Err(e) => {
                            warn!("native enumerate failed, pushdown disabled: {e}");
                            self.pushdown_state
                                .store(PUSHDOWN_REJECTED, AtomicOrdering::SeqCst);
                        }
                    }
                    return Ok(scanned);
                }
                _ => {}
            }
        }

        self.scan_and_filter(ctx, filter).await
    }

    async fn scan_and_filter(
        &self,
        ctx: &OpContext,
        filter: Option<&Filter>,
    ) -> Result<Vec<IdentityRecord>> {
        let scan = self.scan.as_ref().ok_or_else(|| {
            PrismError::validation("registry backend does not support enumeration")
        })?;

        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = scan
                .scan_with_values(ctx, IDENTITY_PREFIX, cursor.as_deref(), MIN_SCAN_BATCH)
                .await?;
            for (_key, raw) in page.entries {
                let record: IdentityRecord = match serde_json::from_slice(&raw) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("skipping corrupt identity record: {e}");
                        continue;
                    }
                };
                if record.expired() {
                    continue;
                }
                if filter.map_or(true, |f| f.evaluate(&record.metadata)) {
                    records.push(record);
                }
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(records)
    }

    /// Number of live identities
    pub async fn count(&self, ctx: &OpContext) -> Result<usize> {
        Ok(self.scan_and_filter(ctx, None).await?.len())
    }
}
