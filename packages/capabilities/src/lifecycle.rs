//! Driver lifecycle contract and the capability-dispatch handle.
//!
//! A pattern never names a backend. It asks for capabilities; the handle is
//! the dispatch table that carries whichever capability views a driver
//! actually implements.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::OpContext;
use crate::error::Result;
use crate::health::HealthReport;
use crate::kv::{KeyValueBasic, KeyValueScan};
use crate::object_store::ObjectStore;
use crate::pubsub::PubSub;
use crate::queue::Queue;
use crate::table::{TableReader, TableWriter};

/// Capabilities a driver may advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    KeyValueBasic,
    KeyValueScan,
    /// The driver honors per-key TTLs on `set`
    KeyValueTtl,
    PubSub,
    Queue,
    ObjectStore,
    TableWriter,
    TableReader,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::KeyValueBasic => "keyvalue_basic",
            Capability::KeyValueScan => "keyvalue_scan",
            Capability::KeyValueTtl => "keyvalue_ttl",
            Capability::PubSub => "pubsub",
            Capability::Queue => "queue",
            Capability::ObjectStore => "object_store",
            Capability::TableWriter => "table_writer",
            Capability::TableReader => "table_reader",
        };
        f.write_str(s)
    }
}

/// Counts reported at the end of a drain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DrainSummary {
    pub drained_operations: u64,
    pub aborted_operations: u64,
}

impl DrainSummary {
    pub fn merge(&mut self, other: DrainSummary) {
        self.drained_operations += other.drained_operations;
        self.aborted_operations += other.aborted_operations;
    }
}

/// Lifecycle contract every driver adapter implements
#[async_trait]
pub trait DriverLifecycle: Send + Sync {
    /// Stable driver name, e.g. `memory` or `nats`
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Validate options and establish connections; called once before start
    async fn initialize(&self, options: &BTreeMap<String, String>) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Stop intake, finish in-flight work within the context deadline
    async fn drain(&self, ctx: &OpContext) -> Result<DrainSummary>;

    async fn stop(&self) -> Result<()>;

    /// Must return in bounded time (callers wrap with a deadline)
    async fn health(&self) -> HealthReport;
}

/// Dispatch handle for one bound driver: the lifecycle plus whichever
/// capability views the driver implements.
#[derive(Clone)]
pub struct DriverHandle {
    pub lifecycle: Arc<dyn DriverLifecycle>,
    pub kv: Option<Arc<dyn KeyValueBasic>>,
    pub kv_scan: Option<Arc<dyn KeyValueScan>>,
    pub pubsub: Option<Arc<dyn PubSub>>,
    pub queue: Option<Arc<dyn Queue>>,
    pub objects: Option<Arc<dyn ObjectStore>>,
    pub table_writer: Option<Arc<dyn TableWriter>>,
    pub table_reader: Option<Arc<dyn TableReader>>,
}

impl DriverHandle {
    pub fn new(lifecycle: Arc<dyn DriverLifecycle>) -> Self {
        Self {
            lifecycle,
            kv: None,
            kv_scan: None,
            pubsub: None,
            queue: None,
            objects: None,
            table_writer: None,
            table_reader: None,
        }
    }

    pub fn with_kv(mut self, kv: Arc<dyn KeyValueBasic>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_kv_scan(mut self, scan: Arc<dyn KeyValueScan>) -> Self {
        self.kv_scan = Some(scan);
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn with_table(
        mut self,
        writer: Arc<dyn TableWriter>,
        reader: Arc<dyn TableReader>,
    ) -> Self {
        self.table_writer = Some(writer);
        self.table_reader = Some(reader);
        self
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    /// Does this driver expose the capability view AND advertise it?
    pub fn has(&self, capability: Capability) -> bool {
        let advertised = self.lifecycle.capabilities().contains(&capability);
        let wired = match capability {
            Capability::KeyValueBasic => self.kv.is_some(),
            Capability::KeyValueScan => self.kv_scan.is_some(),
            Capability::KeyValueTtl => self.kv.is_some(),
            Capability::PubSub => self.pubsub.is_some(),
            Capability::Queue => self.queue.is_some(),
            Capability::ObjectStore => self.objects.is_some(),
            Capability::TableWriter => self.table_writer.is_some(),
            Capability::TableReader => self.table_reader.is_some(),
        };
        advertised && wired
    }

    /// Does this driver satisfy every capability in the set?
    pub fn satisfies(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.has(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl DriverLifecycle for Bare {
        fn name(&self) -> &str {
            "bare"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::KeyValueBasic]
        }
        async fn initialize(&self, _options: &BTreeMap<String, String>) -> Result<()> {
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn drain(&self, _ctx: &OpContext) -> Result<DrainSummary> {
            Ok(DrainSummary::default())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn health(&self) -> HealthReport {
            HealthReport::healthy()
        }
    }

    #[test]
    fn advertised_but_unwired_capability_does_not_satisfy() {
        let handle = DriverHandle::new(Arc::new(Bare));
        // Advertises KeyValueBasic but no view is wired in.
        assert!(!handle.has(Capability::KeyValueBasic));
        assert!(!handle.satisfies(&[Capability::KeyValueBasic]));
        assert!(handle.satisfies(&[]));
    }
}
