//! In-memory append-only event log with header filtering.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use prism_capabilities::{OpContext, Result, TableEvent, TableReader, TableWriter};
use uuid::Uuid;

/// Append log per table; queries filter on header equality in append order
pub struct MemoryTable {
    tables: DashMap<String, Vec<TableEvent>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableWriter for MemoryTable {
    async fn append(
        &self,
        _ctx: &OpContext,
        table: &str,
        headers: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<String> {
        let event = TableEvent {
            id: Uuid::new_v4().to_string(),
            headers,
            payload,
            written_at: Utc::now(),
        };
        let id = event.id.clone();
        self.tables.entry(table.to_string()).or_default().push(event);
        Ok(id)
    }
}

#[async_trait]
impl TableReader for MemoryTable {
    async fn query(
        &self,
        _ctx: &OpContext,
        table: &str,
        header_filter: BTreeMap<String, String>,
        limit: usize,
    ) -> Result<Vec<TableEvent>> {
        let Some(events) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(events
            .iter()
            .filter(|e| {
                header_filter
                    .iter()
                    .all(|(k, v)| e.headers.get(k) == Some(v))
            })
            .take(limit.max(1))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_filters_on_all_headers() {
        let table = MemoryTable::new();
        let ctx = OpContext::new();
        for (to, kind) in [("alice", "hello"), ("bob", "hello"), ("alice", "bye")] {
            let headers = BTreeMap::from([
                ("to".to_string(), to.to_string()),
                ("kind".to_string(), kind.to_string()),
            ]);
            table.append(&ctx, "mailbox", headers, vec![]).await.unwrap();
        }

        let filter = BTreeMap::from([
            ("to".to_string(), "alice".to_string()),
            ("kind".to_string(), "hello".to_string()),
        ]);
        let events = table.query(&ctx, "mailbox", filter, 10).await.unwrap();
        assert_eq!(events.len(), 1);

        let events = table.query(&ctx, "missing", BTreeMap::new(), 10).await.unwrap();
        assert!(events.is_empty());
    }
}
