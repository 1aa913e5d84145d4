//! In-memory object store with size enforcement and checksums.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prism_capabilities::{ObjectMetadata, ObjectStore, OpContext, PrismError, Result};
use sha2::{Digest, Sha256};

/// Default object size cap (64 MiB)
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    metadata: ObjectMetadata,
}

impl StoredObject {
    fn expired(&self) -> bool {
        matches!(self.metadata.expires_at, Some(at) if at <= Utc::now())
    }
}

/// Bucketed blob map. The size cap is enforced on `put`; an oversized
/// payload is a validation error, exactly at the cap succeeds.
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    max_object_size: usize,
}

impl MemoryObjectStore {
    pub fn new(max_object_size: usize) -> Self {
        Self {
            objects: DashMap::new(),
            max_object_size,
        }
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    fn live(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let full = Self::object_key(bucket, key);
        let object = self.objects.get(&full)?.clone();
        if object.expired() {
            self.objects.remove(&full);
            return None;
        }
        Some(object)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, _ctx: &OpContext, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() > self.max_object_size {
            return Err(PrismError::validation(format!(
                "object {bucket}/{key} is {} bytes, cap is {}",
                bytes.len(),
                self.max_object_size
            )));
        }
        let checksum = hex::encode(Sha256::digest(&bytes));
        let metadata = ObjectMetadata {
            size: bytes.len() as u64,
            content_type: None,
            created_at: Utc::now(),
            expires_at: None,
            checksum: Some(checksum),
        };
        self.objects
            .insert(Self::object_key(bucket, key), StoredObject { bytes, metadata });
        Ok(())
    }

    async fn get(&self, _ctx: &OpContext, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.live(bucket, key)
            .map(|o| o.bytes)
            .ok_or_else(|| PrismError::not_found(format!("object {bucket}/{key}")))
    }

    async fn delete(&self, _ctx: &OpContext, bucket: &str, key: &str) -> Result<()> {
        self.objects.remove(&Self::object_key(bucket, key));
        Ok(())
    }

    async fn exists(&self, _ctx: &OpContext, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.live(bucket, key).is_some())
    }

    async fn get_metadata(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectMetadata> {
        self.live(bucket, key)
            .map(|o| o.metadata)
            .ok_or_else(|| PrismError::not_found(format!("object {bucket}/{key}")))
    }

    async fn set_ttl(&self, _ctx: &OpContext, bucket: &str, key: &str, ttl: Duration) -> Result<()> {
        let full = Self::object_key(bucket, key);
        let mut object = self
            .objects
            .get_mut(&full)
            .ok_or_else(|| PrismError::not_found(format!("object {bucket}/{key}")))?;
        let expires_at: DateTime<Utc> =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        object.metadata.expires_at = Some(expires_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn size_cap_is_a_hard_boundary() {
        let store = MemoryObjectStore::new(8);
        let ctx = OpContext::new();
        store.put(&ctx, "b", "exact", vec![0u8; 8]).await.unwrap();
        let err = store
            .put(&ctx, "b", "over", vec![0u8; 9])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn metadata_carries_checksum() {
        let store = MemoryObjectStore::new(DEFAULT_MAX_OBJECT_SIZE);
        let ctx = OpContext::new();
        store.put(&ctx, "b", "k", b"payload".to_vec()).await.unwrap();
        let meta = store.get_metadata(&ctx, "b", "k").await.unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(
            meta.checksum.unwrap(),
            hex::encode(Sha256::digest(b"payload"))
        );
    }

    #[tokio::test]
    async fn delete_then_exists_is_false() {
        let store = MemoryObjectStore::new(DEFAULT_MAX_OBJECT_SIZE);
        let ctx = OpContext::new();
        store.put(&ctx, "b", "k", vec![1]).await.unwrap();
        store.delete(&ctx, "b", "k").await.unwrap();
        assert!(!store.exists(&ctx, "b", "k").await.unwrap());
        assert!(store.get(&ctx, "b", "k").await.unwrap_err().is_not_found());
    }
}
