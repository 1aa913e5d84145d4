//! # Prism Multicast Registry
//!
//! The canonical pattern composed from slots: a registry backend holds
//! identities with TTLs, a messaging backend fans payloads out to the
//! identities matching a filter, and an optional durability queue upgrades
//! delivery to exactly-once.
//!
//! - [`filter`]: the typed predicate tree and its pure evaluator.
//! - [`registry`]: registration, TTL authority, filtered enumeration.
//! - [`multicast`]: parallel fan-out with configurable semantics.
//! - [`pattern`]: the slot wiring that makes it a hostable pattern.

pub mod filter;
pub mod multicast;
pub mod pattern;
pub mod registry;

pub use filter::Filter;
pub use multicast::{MulticastDispatcher, MulticastOutcome};
pub use pattern::MulticastRegistryPattern;
pub use registry::{IdentityRecord, RegistryCoordinator, RegistryLimits};
