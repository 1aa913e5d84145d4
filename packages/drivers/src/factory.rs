//! Driver factory: config `type` strings to adapter handles.

use std::collections::BTreeMap;

use prism_capabilities::{DriverHandle, PrismError, Result};
use serde::{Deserialize, Serialize};

use crate::memory::memory_handle;
use crate::nats::nats_handle;
use crate::postgres_table::postgres_handle;
use crate::redb_kv::redb_handle;

/// Backend kinds the factory knows how to build
pub const KNOWN_KINDS: &[&str] = &["memory", "nats", "redb", "postgres"];

/// One driver requirement from pattern configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverSpec {
    /// Backend type, e.g. `memory` or `nats`
    #[serde(rename = "type")]
    pub kind: String,
    /// Backend-specific options (`servers`, `path`, `url`, ...)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl DriverSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Construct the adapter for `spec`. The returned handle still needs
/// `initialize` + `start` through its lifecycle before use.
pub fn create_driver(spec: &DriverSpec) -> Result<DriverHandle> {
    match spec.kind.as_str() {
        "memory" => memory_handle(&spec.options),
        "nats" => Ok(nats_handle()),
        "redb" => Ok(redb_handle()),
        "postgres" => Ok(postgres_handle()),
        other => Err(PrismError::validation(format!(
            "unknown driver type {other:?}, expected one of {}",
            KNOWN_KINDS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_capabilities::Capability;

    #[test]
    fn memory_spec_builds_full_capability_driver() {
        let handle = create_driver(&DriverSpec::new("memory")).unwrap();
        assert!(handle.satisfies(&[
            Capability::KeyValueBasic,
            Capability::KeyValueTtl,
            Capability::PubSub,
            Capability::Queue,
            Capability::ObjectStore,
        ]));
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let err = match create_driver(&DriverSpec::new("etcd")) {
            Err(e) => e,
            Ok(_) => panic!("expected validation error"),
        };
        assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn nats_spec_exposes_pubsub_only() {
        let handle = create_driver(&DriverSpec::new("nats")).unwrap();
        assert!(handle.satisfies(&[Capability::PubSub]));
        assert!(!handle.satisfies(&[Capability::Queue]));
    }
}
