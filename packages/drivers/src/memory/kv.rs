//! In-memory key/value with TTL.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use prism_capabilities::{
    KeyValueBasic, KeyValueScan, OpContext, Result, ScanPage, ScanValuesPage,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Instant::now())
    }
}

/// Concurrent map with lazy expiry on read plus a background reaper
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
    reaper: parking_lot::Mutex<Option<CancellationToken>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            reaper: parking_lot::Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn start_reaper(self: &std::sync::Arc<Self>) {
        let mut guard = self.reaper.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        let kv = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => kv.entries.retain(|_, e| !e.expired()),
                }
            }
        });
    }

    pub(crate) fn stop_reaper(&self) {
        if let Some(token) = self.reaper.lock().take() {
            token.cancel();
        }
    }

    /// Live (non-expired) entry lookup; removes the key when expired
    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    /// Sorted live keys under `prefix`, resuming after `cursor`
    fn page(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> (Vec<String>, Option<String>) {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|k| cursor.map_or(true, |c| k.as_str() > c))
            .collect();
        let limit = limit.max(1);
        if keys.len() > limit {
            let page: Vec<String> = keys.into_iter().take(limit).collect();
            let cursor = page.last().cloned();
            (page, cursor)
        } else {
            (keys, None)
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueBasic for MemoryKv {
    async fn set(
        &self,
        _ctx: &OpContext,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, _ctx: &OpContext, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn delete(&self, _ctx: &OpContext, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, _ctx: &OpContext, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }
}

#[async_trait]
impl KeyValueScan for MemoryKv {
    async fn scan(
        &self,
        _ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage> {
        let (keys, cursor) = self.page(prefix, cursor, limit);
        Ok(ScanPage { keys, cursor })
    }

    async fn scan_with_values(
        &self,
        _ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanValuesPage> {
        let (keys, cursor) = self.page(prefix, cursor, limit);
        let entries = keys
            .into_iter()
            .filter_map(|k| self.live(&k).map(|e| (k, e.value)))
            .collect();
        Ok(ScanValuesPage { entries, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let kv = MemoryKv::new();
        let ctx = OpContext::new();
        kv.set(&ctx, "k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(kv.get(&ctx, "k").await.unwrap(), Some(b"v".to_vec()));
        kv.delete(&ctx, "k").await.unwrap();
        assert!(!kv.exists(&ctx, "k").await.unwrap());
        assert_eq!(kv.get(&ctx, "k").await.unwrap(), None);
        // Deleting again is fine.
        kv.delete(&ctx, "k").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_without_reaper() {
        let kv = MemoryKv::new();
        let ctx = OpContext::new();
        kv.set(&ctx, "k", b"v".to_vec(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(kv.exists(&ctx, "k").await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!kv.exists(&ctx, "k").await.unwrap());
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let kv = MemoryKv::new();
        let ctx = OpContext::new();
        for i in 0..250 {
            kv.set(&ctx, &format!("id:{i:04}"), vec![1], None)
                .await
                .unwrap();
        }
        kv.set(&ctx, "other", vec![1], None).await.unwrap();

        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = kv.scan(&ctx, "id:", cursor.as_deref(), 100).await.unwrap();
            all.extend(page.keys);
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(all.len(), 250);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }
}
