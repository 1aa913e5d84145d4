//! # Prism Capability Interfaces
//!
//! The narrow contracts that backend drivers implement and patterns consume.
//! A driver exposes one or more capabilities (key/value, pub/sub, queue,
//! object store, table log) plus the [`DriverLifecycle`] contract; a pattern
//! declares which capabilities each of its slots requires and is bound to
//! drivers that satisfy them.
//!
//! Nothing in this crate touches a backend. It is types, traits, and the
//! error taxonomy every other Prism crate shares.

pub mod context;
pub mod error;
pub mod health;
pub mod kv;
pub mod lifecycle;
pub mod object_store;
pub mod pubsub;
pub mod queue;
pub mod table;
pub mod value;

pub use context::OpContext;
pub use error::{ErrorKind, PrismError, Result};
pub use health::{HealthReport, HealthStatus};
pub use kv::{KeyValueBasic, KeyValueScan, ScanPage, ScanValuesPage, MIN_SCAN_BATCH};
pub use lifecycle::{Capability, DrainSummary, DriverHandle, DriverLifecycle};
pub use object_store::{ObjectMetadata, ObjectStore};
pub use pubsub::{
    subscription_channel, Message, PubSub, Subscription, SubscriptionSender,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use queue::{Queue, QueueMessage, QueueReceiver};
pub use table::{TableEvent, TableReader, TableWriter};
pub use value::{Metadata, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
