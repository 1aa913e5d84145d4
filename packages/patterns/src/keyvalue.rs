//! KeyValue pattern: the thinnest composition, one storage slot exposed
//! straight through the generic data plane.

use async_trait::async_trait;
use prism_capabilities::{Capability, PrismError, Result};

use crate::config::PatternConfig;
use crate::runtime::{InterfaceDeclaration, PatternBehavior, PatternDescriptor};
use crate::slots::{SlotDescriptor, SlotTable};

/// Client-facing key/value service over any KV-capable driver
pub struct KeyValuePattern;

#[async_trait]
impl PatternBehavior for KeyValuePattern {
    fn descriptor(&self) -> PatternDescriptor {
        PatternDescriptor {
            name: "keyvalue".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            slots: vec![
                SlotDescriptor::required("keyvalue", vec![Capability::KeyValueBasic]),
            ],
            interfaces: vec![
                InterfaceDeclaration::new(
                    "KeyValueBasicInterface",
                    "prism.keyvalue.v1.KeyValueBasic",
                    "v1",
                ),
                InterfaceDeclaration::new(
                    "KeyValueScanInterface",
                    "prism.keyvalue.v1.KeyValueScan",
                    "v1",
                ),
            ],
        }
    }

    async fn on_initialize(&self, slots: &SlotTable, _config: &PatternConfig) -> Result<()> {
        // Scans are optional; basic storage is not.
        let handle = slots.require("keyvalue")?;
        if !handle.has(Capability::KeyValueBasic) {
            return Err(PrismError::validation(
                "keyvalue slot driver lacks basic key/value support",
            ));
        }
        Ok(())
    }
}
