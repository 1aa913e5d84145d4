//! Pattern configuration model.
//!
//! One struct covers every pattern; each pattern reads the sections it
//! cares about. Configuration arrives either as a TOML file (pattern host)
//! or as the JSON payload of the lifecycle `Initialize` call; the same
//! serde model handles both.

use std::collections::BTreeMap;
use std::time::Duration;

use prism_drivers::DriverSpec;
use serde::{Deserialize, Serialize};

/// Fan-out delivery semantics for messaging patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    #[serde(rename = "at-most-once")]
    AtMostOnce,
    #[serde(rename = "at-least-once")]
    AtLeastOnce,
    #[serde(rename = "exactly-once")]
    ExactlyOnce,
}

/// Messaging slot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub delivery: DeliveryMode,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_topic_prefix() -> String {
    "prism.registry.".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl MessagingConfig {
    pub fn driver_spec(&self) -> DriverSpec {
        let mut spec = DriverSpec::new(self.kind.clone());
        spec.options = self.options.clone();
        if !self.servers.is_empty() {
            spec.options
                .insert("servers".to_string(), self.servers.join(","));
        }
        spec
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Durability (queue) slot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurabilityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    7
}

impl DurabilityConfig {
    pub fn driver_spec(&self) -> Option<DriverSpec> {
        if !self.enabled {
            return None;
        }
        let kind = self.kind.clone()?;
        let mut spec = DriverSpec::new(kind);
        spec.options = self.options.clone();
        Some(spec)
    }
}

/// Claim-check handling for the Consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimCheckConfig {
    #[serde(default)]
    pub delete_after_read: bool,
}

/// Consumer-specific behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub consumer_group: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default)]
    pub claim_check: ClaimCheckConfig,
}

fn default_max_retries() -> u32 {
    3
}

fn default_auto_commit() -> bool {
    true
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            consumer_group: String::new(),
            topic: String::new(),
            max_retries: default_max_retries(),
            auto_commit: default_auto_commit(),
            processing_timeout_ms: default_processing_timeout_ms(),
            claim_check: ClaimCheckConfig::default(),
        }
    }
}

impl BehaviorConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

/// Configuration for one pattern instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub pattern_name: String,
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
    #[serde(default = "default_max_identities")]
    pub max_identities: usize,
    #[serde(default = "default_max_filter_depth")]
    pub max_filter_depth: usize,
    #[serde(default = "default_max_clauses")]
    pub max_clauses: usize,
    #[serde(default = "default_max_metadata_entries")]
    pub max_metadata_entries: usize,

    // Slot sections. Patterns read the ones their descriptor names.
    #[serde(default)]
    pub registry: Option<DriverSpec>,
    #[serde(default)]
    pub messaging: Option<MessagingConfig>,
    #[serde(default)]
    pub durability: Option<DurabilityConfig>,
    #[serde(default)]
    pub source: Option<DriverSpec>,
    #[serde(default)]
    pub state: Option<DriverSpec>,
    #[serde(default)]
    pub dead_letter: Option<DriverSpec>,
    #[serde(default)]
    pub objects: Option<DriverSpec>,
    #[serde(default)]
    pub keyvalue: Option<DriverSpec>,

    #[serde(default)]
    pub behavior: BehaviorConfig,
}

fn default_max_identities() -> usize {
    10_000
}

fn default_max_filter_depth() -> usize {
    5
}

fn default_max_clauses() -> usize {
    32
}

fn default_max_metadata_entries() -> usize {
    64
}

impl PatternConfig {
    pub fn new(pattern_name: impl Into<String>) -> Self {
        Self {
            pattern_name: pattern_name.into(),
            default_ttl_secs: None,
            max_identities: default_max_identities(),
            max_filter_depth: default_max_filter_depth(),
            max_clauses: default_max_clauses(),
            max_metadata_entries: default_max_metadata_entries(),
            registry: None,
            messaging: None,
            durability: None,
            source: None,
            state: None,
            dead_letter: None,
            objects: None,
            keyvalue: None,
            behavior: BehaviorConfig::default(),
        }
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Every slot section present in this config, as factory specs keyed by
    /// slot name.
    pub fn slot_specs(&self) -> Vec<(String, DriverSpec)> {
        let mut specs = Vec::new();
        let mut push = |name: &str, spec: Option<DriverSpec>| {
            if let Some(spec) = spec {
                specs.push((name.to_string(), spec));
            }
        };
        push("registry", self.registry.clone());
        push("messaging", self.messaging.as_ref().map(|m| m.driver_spec()));
        push(
            "durability",
            self.durability.as_ref().and_then(|d| d.driver_spec()),
        );
        push("source", self.source.clone());
        push("state", self.state.clone());
        push("dead_letter", self.dead_letter.clone());
        push("objects", self.objects.clone());
        push("keyvalue", self.keyvalue.clone());
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_with_defaults() {
        let raw = r#"
            pattern_name = "multicast-registry"
            max_identities = 500

            [registry]
            type = "memory"

            [messaging]
            type = "memory"
            topic_prefix = "chat."
            delivery = "at-least-once"
        "#;
        let config: PatternConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pattern_name, "multicast-registry");
        assert_eq!(config.max_identities, 500);
        assert_eq!(config.max_filter_depth, 5);
        let messaging = config.messaging.as_ref().unwrap();
        assert_eq!(messaging.delivery, DeliveryMode::AtLeastOnce);
        assert_eq!(messaging.topic_prefix, "chat.");
        assert_eq!(messaging.retry_attempts, 3);
        assert_eq!(config.slot_specs().len(), 2);
    }

    #[test]
    fn disabled_durability_produces_no_slot() {
        let durability = DurabilityConfig {
            enabled: false,
            kind: Some("memory".to_string()),
            options: BTreeMap::new(),
            retention_days: 7,
        };
        assert!(durability.driver_spec().is_none());
    }

    #[test]
    fn messaging_servers_flow_into_driver_options() {
        let raw = r#"
            type = "nats"
            servers = ["nats://one:4222", "nats://two:4222"]
        "#;
        let messaging: MessagingConfig = toml::from_str(raw).unwrap();
        let spec = messaging.driver_spec();
        assert_eq!(
            spec.options.get("servers").unwrap(),
            "nats://one:4222,nats://two:4222"
        );
    }
}
