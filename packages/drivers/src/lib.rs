//! # Prism Driver Adapters
//!
//! Concrete backends behind the capability interfaces. Every adapter
//! converts backend-specific failures into the shared error taxonomy at this
//! boundary and honors the caller's deadline.
//!
//! | Driver | Capabilities |
//! |---|---|
//! | `memory` | everything; the reference driver and the test backend |
//! | `nats` | pub/sub over core NATS subjects |
//! | `redb` | persistent key/value with TTL and prefix scans |
//! | `postgres` | append-only event-log tables |
//!
//! Drivers are constructed through [`factory::create_driver`], which maps
//! the `type` string in pattern configuration to an adapter.

pub mod factory;
pub mod memory;
pub mod nats;
pub mod postgres_table;
pub mod redb_kv;

pub use factory::{create_driver, DriverSpec};
pub use memory::memory_handle;
