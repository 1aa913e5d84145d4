//! In-memory driver: the reference implementation of every capability.
//!
//! Used as the `memory` backend type and throughout the test suites. All
//! state dies with the process.

mod kv;
mod object_store;
mod pubsub;
mod queue;
mod table;

pub use kv::MemoryKv;
pub use object_store::MemoryObjectStore;
pub use pubsub::MemoryPubSub;
pub use queue::MemoryQueue;
pub use table::MemoryTable;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prism_capabilities::{
    Capability, DrainSummary, DriverHandle, DriverLifecycle, HealthReport, OpContext, Result,
};

const ALL_CAPABILITIES: &[Capability] = &[
    Capability::KeyValueBasic,
    Capability::KeyValueScan,
    Capability::KeyValueTtl,
    Capability::PubSub,
    Capability::Queue,
    Capability::ObjectStore,
    Capability::TableWriter,
    Capability::TableReader,
];

/// Lifecycle wrapper tying the in-memory components together
pub struct MemoryDriver {
    kv: Arc<MemoryKv>,
    pubsub: Arc<MemoryPubSub>,
    queue: Arc<MemoryQueue>,
    objects: Arc<MemoryObjectStore>,
    table: Arc<MemoryTable>,
    started: AtomicBool,
}

impl MemoryDriver {
    pub fn new(options: &BTreeMap<String, String>) -> Result<Self> {
        let channel_capacity = parse_opt(options, "channel_capacity")?
            .unwrap_or(prism_capabilities::DEFAULT_CHANNEL_CAPACITY);
        let max_object_size =
            parse_opt(options, "max_object_size")?.unwrap_or(object_store::DEFAULT_MAX_OBJECT_SIZE);
        Ok(Self {
            kv: Arc::new(MemoryKv::new()),
            pubsub: Arc::new(MemoryPubSub::new(channel_capacity)),
            queue: Arc::new(MemoryQueue::new()),
            objects: Arc::new(MemoryObjectStore::new(max_object_size)),
            table: Arc::new(MemoryTable::new()),
            started: AtomicBool::new(false),
        })
    }
}

fn parse_opt(options: &BTreeMap<String, String>, key: &str) -> Result<Option<usize>> {
    match options.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<usize>().map(Some).map_err(|_| {
            prism_capabilities::PrismError::validation(format!("option {key}: not a number: {raw}"))
        }),
    }
}

#[async_trait]
impl DriverLifecycle for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> &[Capability] {
        ALL_CAPABILITIES
    }

    async fn initialize(&self, _options: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.kv.start_reaper();
            self.queue.start_sweeper();
        }
        Ok(())
    }

    async fn drain(&self, ctx: &OpContext) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        summary.merge(self.queue.drain(ctx).await);
        Ok(summary)
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.kv.stop_reaper();
        self.queue.stop();
        self.pubsub.close_all();
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy()
            .with_detail("keys", self.kv.len().to_string())
            .with_detail("topics", self.pubsub.topic_count().to_string())
            .with_detail("dropped_messages", self.pubsub.dropped_total().to_string())
    }
}

/// Build a fully-wired handle for the in-memory driver
pub fn memory_handle(options: &BTreeMap<String, String>) -> Result<DriverHandle> {
    let driver = Arc::new(MemoryDriver::new(options)?);
    Ok(DriverHandle::new(driver.clone())
        .with_kv(driver.kv.clone())
        .with_kv_scan(driver.kv.clone())
        .with_pubsub(driver.pubsub.clone())
        .with_queue(driver.queue.clone())
        .with_objects(driver.objects.clone())
        .with_table(driver.table.clone(), driver.table.clone()))
}
