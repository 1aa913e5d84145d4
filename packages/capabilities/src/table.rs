//! Event-log table capability contracts, used by the mailbox table.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::error::Result;

/// One appended event with its indexed headers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEvent {
    pub id: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub written_at: DateTime<Utc>,
}

/// Append-only event-log writer with indexed headers
#[async_trait]
pub trait TableWriter: Send + Sync {
    async fn append(
        &self,
        ctx: &OpContext,
        table: &str,
        headers: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<String>;
}

/// Filtered query over an event-log table. All header filter entries must
/// match (equality); events come back in append order.
#[async_trait]
pub trait TableReader: Send + Sync {
    async fn query(
        &self,
        ctx: &OpContext,
        table: &str,
        header_filter: BTreeMap<String, String>,
        limit: usize,
    ) -> Result<Vec<TableEvent>>;
}
