//! redb driver: persistent key/value with TTL and prefix scans.
//!
//! Values are stored as an 8-byte big-endian expiry timestamp (unix millis,
//! zero for none) followed by the raw bytes. Expired keys are elided on
//! read and reclaimed by a background compaction pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prism_capabilities::{
    Capability, DrainSummary, DriverHandle, DriverLifecycle, HealthReport, KeyValueBasic,
    KeyValueScan, OpContext, PrismError, Result, ScanPage, ScanValuesPage,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const COMPACTION_INTERVAL: Duration = Duration::from_secs(30);

const CAPABILITIES: &[Capability] = &[
    Capability::KeyValueBasic,
    Capability::KeyValueScan,
    Capability::KeyValueTtl,
];

fn encode(expires_at_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&expires_at_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(raw: &[u8]) -> Option<(u64, Vec<u8>)> {
    if raw.len() < 8 {
        return None;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&raw[..8]);
    Some((u64::from_be_bytes(prefix), raw[8..].to_vec()))
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn live(raw: &[u8]) -> Option<Vec<u8>> {
    let (expires_at_ms, value) = decode(raw)?;
    if expires_at_ms != 0 && expires_at_ms <= now_ms() {
        return None;
    }
    Some(value)
}

fn storage_err(what: &str, e: impl std::fmt::Display) -> PrismError {
    PrismError::transient(format!("redb {what}: {e}"))
}

/// Persistent KV adapter on a local redb database file
pub struct RedbKv {
    db: OnceCell<Arc<Database>>,
    reaper: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RedbKv {
    pub fn new() -> Self {
        Self {
            db: OnceCell::new(),
            reaper: parking_lot::Mutex::new(None),
        }
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.db
            .get()
            .cloned()
            .ok_or_else(|| PrismError::conflict("redb driver not initialized"))
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Database>) -> Result<T> + Send + 'static,
    {
        let db = self.database()?;
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| PrismError::fatal(format!("redb {what} task: {e}")))?
    }

    /// Delete every expired key. Returns how many were reclaimed.
    fn compact(db: &Database) -> Result<u64> {
        let txn = db.begin_write().map_err(|e| storage_err("begin", e))?;
        let mut reclaimed = 0u64;
        {
            let mut table = txn.open_table(KV).map_err(|e| storage_err("open", e))?;
            let expired: Vec<String> = table
                .iter()
                .map_err(|e| storage_err("iter", e))?
                .flatten()
                .filter(|(_, v)| live(v.value()).is_none())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for key in expired {
                table
                    .remove(key.as_str())
                    .map_err(|e| storage_err("remove", e))?;
                reclaimed += 1;
            }
        }
        txn.commit().map_err(|e| storage_err("commit", e))?;
        Ok(reclaimed)
    }

    fn page(
        db: &Database,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
        with_values: bool,
    ) -> Result<(Vec<(String, Vec<u8>)>, Option<String>)> {
        let txn = db.begin_read().map_err(|e| storage_err("begin read", e))?;
        let table = match txn.open_table(KV) {
            Ok(table) => table,
            // Nothing written yet.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), None)),
            Err(e) => return Err(storage_err("open", e)),
        };

        let limit = limit.max(1);
        let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(limit);
        let mut more = false;
        for item in table
            .range(prefix..)
            .map_err(|e| storage_err("range", e))?
        {
            let (key, raw) = item.map_err(|e| storage_err("range item", e))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(cursor) = cursor {
                if key <= cursor {
                    continue;
                }
            }
            let Some(value) = live(raw.value()) else {
                continue;
            };
            if entries.len() == limit {
                more = true;
                break;
            }
            let value = if with_values { value } else { Vec::new() };
            entries.push((key.to_string(), value));
        }
        let cursor = if more {
            entries.last().map(|(k, _)| k.clone())
        } else {
            None
        };
        Ok((entries, cursor))
    }
}

impl Default for RedbKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverLifecycle for RedbKv {
    fn name(&self) -> &str {
        "redb"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn initialize(&self, options: &BTreeMap<String, String>) -> Result<()> {
        if self.db.get().is_some() {
            return Ok(());
        }
        let path = options
            .get("path")
            .ok_or_else(|| PrismError::validation("redb driver requires a path option"))?
            .clone();
        let db = tokio::task::spawn_blocking(move || Database::create(&path))
            .await
            .map_err(|e| PrismError::fatal(format!("redb open task: {e}")))?
            .map_err(|e| PrismError::fatal(format!("redb open: {e}")))?;
        self.db
            .set(Arc::new(db))
            .map_err(|_| PrismError::conflict("redb driver already initialized"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let db = self.database()?;
        let mut guard = self.reaper.lock();
        if guard.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(COMPACTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => {
                        let db = db.clone();
                        let result = tokio::task::spawn_blocking(move || Self::compact(&db)).await;
                        match result {
                            Ok(Ok(n)) if n > 0 => debug!("redb compaction reclaimed {n} keys"),
                            Ok(Err(e)) => warn!("redb compaction failed: {e}"),
                            _ => {}
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn drain(&self, _ctx: &OpContext) -> Result<DrainSummary> {
        Ok(DrainSummary::default())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(token) = self.reaper.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        match self.db.get() {
            Some(_) => HealthReport::healthy(),
            None => HealthReport::unhealthy("not initialized"),
        }
    }
}

#[async_trait]
impl KeyValueBasic for RedbKv {
    async fn set(
        &self,
        _ctx: &OpContext,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = key.to_string();
        let expires_at_ms = ttl.map(|t| now_ms() + t.as_millis() as u64).unwrap_or(0);
        self.blocking("set", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin", e))?;
            {
                let mut table = txn.open_table(KV).map_err(|e| storage_err("open", e))?;
                table
                    .insert(key.as_str(), encode(expires_at_ms, &value).as_slice())
                    .map_err(|e| storage_err("insert", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn get(&self, _ctx: &OpContext, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking("get", move |db| {
            let txn = db.begin_read().map_err(|e| storage_err("begin read", e))?;
            let table = match txn.open_table(KV) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(storage_err("open", e)),
            };
            let raw = table.get(key.as_str()).map_err(|e| storage_err("get", e))?;
            Ok(raw.and_then(|guard| live(guard.value())))
        })
        .await
    }

    async fn delete(&self, _ctx: &OpContext, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking("delete", move |db| {
            let txn = db.begin_write().map_err(|e| storage_err("begin", e))?;
            {
                let mut table = txn.open_table(KV).map_err(|e| storage_err("open", e))?;
                table
                    .remove(key.as_str())
                    .map_err(|e| storage_err("remove", e))?;
            }
            txn.commit().map_err(|e| storage_err("commit", e))
        })
        .await
    }

    async fn exists(&self, ctx: &OpContext, key: &str) -> Result<bool> {
        Ok(self.get(ctx, key).await?.is_some())
    }
}

#[async_trait]
impl KeyValueScan for RedbKv {
    async fn scan(
        &self,
        _ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage> {
        let prefix = prefix.to_string();
        let cursor = cursor.map(|c| c.to_string());
        let (entries, cursor) = self
            .blocking("scan", move |db| {
                Self::page(&db, &prefix, cursor.as_deref(), limit, false)
            })
            .await?;
        Ok(ScanPage {
            keys: entries.into_iter().map(|(k, _)| k).collect(),
            cursor,
        })
    }

    async fn scan_with_values(
        &self,
        _ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanValuesPage> {
        let prefix = prefix.to_string();
        let cursor = cursor.map(|c| c.to_string());
        let (entries, cursor) = self
            .blocking("scan", move |db| {
                Self::page(&db, &prefix, cursor.as_deref(), limit, true)
            })
            .await?;
        Ok(ScanValuesPage { entries, cursor })
    }
}

/// Build a handle exposing the redb driver's KV capabilities
pub fn redb_handle() -> DriverHandle {
    let driver = Arc::new(RedbKv::new());
    DriverHandle::new(driver.clone())
        .with_kv(driver.clone())
        .with_kv_scan(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_driver(dir: &TempDir) -> RedbKv {
        let driver = RedbKv::new();
        let options = BTreeMap::from([(
            "path".to_string(),
            dir.path().join("kv.redb").display().to_string(),
        )]);
        driver.initialize(&options).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let ctx = OpContext::new();
        {
            let driver = open_driver(&dir).await;
            driver.set(&ctx, "k", b"v".to_vec(), None).await.unwrap();
        }
        let driver = open_driver(&dir).await;
        assert_eq!(driver.get(&ctx, "k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_keys_are_elided() {
        let dir = TempDir::new().unwrap();
        let ctx = OpContext::new();
        let driver = open_driver(&dir).await;
        driver
            .set(&ctx, "gone", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.get(&ctx, "gone").await.unwrap(), None);
        let page = driver.scan(&ctx, "", None, 100).await.unwrap();
        assert!(page.keys.is_empty());
    }

    #[tokio::test]
    async fn scan_respects_prefix_and_cursor() {
        let dir = TempDir::new().unwrap();
        let ctx = OpContext::new();
        let driver = open_driver(&dir).await;
        for i in 0..5 {
            driver
                .set(&ctx, &format!("p:{i}"), vec![i as u8], None)
                .await
                .unwrap();
        }
        driver.set(&ctx, "q:0", vec![9], None).await.unwrap();

        let first = driver.scan(&ctx, "p:", None, 3).await.unwrap();
        assert_eq!(first.keys, vec!["p:0", "p:1", "p:2"]);
        let rest = driver
            .scan(&ctx, "p:", first.cursor.as_deref(), 3)
            .await
            .unwrap();
        assert_eq!(rest.keys, vec!["p:3", "p:4"]);
        assert!(rest.cursor.is_none());
    }
}
