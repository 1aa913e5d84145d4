//! PostgreSQL driver: append-only event-log tables.
//!
//! One physical table holds every logical event log; headers are stored as
//! a JSON text column and filtered client-side after a logical-table index
//! lookup. Owns its connection task the way every Prism postgres consumer
//! does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use prism_capabilities::{
    Capability, DrainSummary, DriverHandle, DriverLifecycle, HealthReport, OpContext, PrismError,
    Result, TableEvent, TableReader, TableWriter,
};
use tokio::sync::OnceCell;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};
use uuid::Uuid;

const CAPABILITIES: &[Capability] = &[Capability::TableWriter, Capability::TableReader];

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS prism_events (
        seq BIGSERIAL PRIMARY KEY,
        event_id TEXT NOT NULL,
        logical_table TEXT NOT NULL,
        headers TEXT NOT NULL,
        payload BYTEA NOT NULL,
        written_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS prism_events_logical_table_idx
        ON prism_events (logical_table, seq)";

fn pg_err(what: &str, e: tokio_postgres::Error) -> PrismError {
    PrismError::transient(format!("postgres {what}: {e}"))
}

/// Event-log adapter over a single PostgreSQL connection
pub struct PostgresTable {
    client: OnceCell<Client>,
    connected: Arc<AtomicBool>,
}

impl PostgresTable {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get()
            .ok_or_else(|| PrismError::conflict("postgres driver not initialized"))
    }
}

impl Default for PostgresTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverLifecycle for PostgresTable {
    fn name(&self) -> &str {
        "postgres"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn initialize(&self, options: &BTreeMap<String, String>) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let url = options
            .get("url")
            .ok_or_else(|| PrismError::validation("postgres driver requires a url option"))?;
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| pg_err("connect", e))?;

        let connected = self.connected.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection error: {e}");
            }
            connected.store(false, Ordering::SeqCst);
        });

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| pg_err("schema", e))?;
        self.connected.store(true, Ordering::SeqCst);
        self.client
            .set(client)
            .map_err(|_| PrismError::conflict("postgres driver already initialized"))?;
        debug!("postgres driver connected");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.client().map(|_| ())
    }

    async fn drain(&self, _ctx: &OpContext) -> Result<DrainSummary> {
        Ok(DrainSummary::default())
    }

    async fn stop(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        if self.client.get().is_none() {
            return HealthReport::unhealthy("not initialized");
        }
        if !self.connected.load(Ordering::SeqCst) {
            return HealthReport::unhealthy("connection lost");
        }
        HealthReport::healthy()
    }
}

#[async_trait]
impl TableWriter for PostgresTable {
    async fn append(
        &self,
        ctx: &OpContext,
        table: &str,
        headers: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<String> {
        let client = self.client()?;
        let event_id = Uuid::new_v4().to_string();
        let headers_json = serde_json::to_string(&headers)?;
        ctx.run(
            "postgres append",
            client.execute(
                "INSERT INTO prism_events (event_id, logical_table, headers, payload)
                 VALUES ($1, $2, $3, $4)",
                &[&event_id, &table, &headers_json, &payload],
            ),
        )
        .await?
        .map_err(|e| pg_err("insert", e))?;
        Ok(event_id)
    }
}

#[async_trait]
impl TableReader for PostgresTable {
    async fn query(
        &self,
        ctx: &OpContext,
        table: &str,
        header_filter: BTreeMap<String, String>,
        limit: usize,
    ) -> Result<Vec<TableEvent>> {
        let client = self.client()?;
        let rows = ctx
            .run(
                "postgres query",
                client.query(
                    "SELECT event_id, headers, payload, written_at FROM prism_events
                     WHERE logical_table = $1 ORDER BY seq",
                    &[&table],
                ),
            )
            .await?
            .map_err(|e| pg_err("select", e))?;

        let mut events = Vec::new();
        for row in rows {
            let headers_json: String = row.get(1);
            let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)?;
            if !header_filter.iter().all(|(k, v)| headers.get(k) == Some(v)) {
                continue;
            }
            events.push(TableEvent {
                id: row.get(0),
                headers,
                payload: row.get(2),
                written_at: row
                    .try_get::<_, std::time::SystemTime>(3)
                    .map(chrono::DateTime::from)
                    .unwrap_or_else(|_| Utc::now()),
            });
            if events.len() == limit.max(1) {
                break;
            }
        }
        Ok(events)
    }
}

/// Build a handle exposing the postgres driver's table capabilities
pub fn postgres_handle() -> DriverHandle {
    let driver = std::sync::Arc::new(PostgresTable::new());
    DriverHandle::new(driver.clone()).with_table(driver.clone(), driver)
}
