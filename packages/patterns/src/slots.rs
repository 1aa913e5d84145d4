//! Slot descriptors and the binding algorithm.
//!
//! A slot is a named hole in a pattern filled at binding time by a driver
//! that satisfies the slot's capability set. Bindings happen once, before
//! start, and are frozen until stop.

use std::collections::BTreeMap;

use prism_capabilities::{Capability, DriverHandle, PrismError, Result};
use serde::{Deserialize, Serialize};

/// One capability hole in a pattern.
///
/// `any_of` lists alternative capability sets; a candidate fills the slot
/// when it satisfies every capability of at least one set. Most slots have
/// a single set; the Consumer's source slot accepts `{PubSub}` or
/// `{Queue}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub name: String,
    pub any_of: Vec<Vec<Capability>>,
    pub required: bool,
}

impl SlotDescriptor {
    pub fn required(name: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            name: name.into(),
            any_of: vec![capabilities],
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            name: name.into(),
            any_of: vec![capabilities],
            required: false,
        }
    }

    pub fn required_one_of(name: impl Into<String>, any_of: Vec<Vec<Capability>>) -> Self {
        Self {
            name: name.into(),
            any_of,
            required: true,
        }
    }

    fn is_satisfied_by(&self, handle: &DriverHandle) -> bool {
        self.any_of.iter().any(|set| handle.satisfies(set))
    }

    fn describe(&self) -> String {
        self.any_of
            .iter()
            .map(|set| {
                set.iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// A driver offered for binding, tagged with the config section it came from
#[derive(Clone)]
pub struct NamedCandidate {
    pub name: String,
    pub handle: DriverHandle,
}

/// Frozen slot-name -> driver map produced by [`bind_slots`]
#[derive(Clone, Default)]
pub struct SlotTable {
    bindings: BTreeMap<String, DriverHandle>,
}

impl SlotTable {
    pub fn get(&self, slot: &str) -> Option<&DriverHandle> {
        self.bindings.get(slot)
    }

    /// A required slot; absence after binding is a programming error
    /// surfaced as a conflict.
    pub fn require(&self, slot: &str) -> Result<&DriverHandle> {
        self.bindings
            .get(slot)
            .ok_or_else(|| PrismError::conflict(format!("slot {slot} is not bound")))
    }

    pub fn is_bound(&self, slot: &str) -> bool {
        self.bindings.contains_key(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DriverHandle)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Bind candidates to slots.
///
/// A candidate whose name matches the slot name is chosen first (that is
/// how configuration sections direct drivers to slots); otherwise exactly
/// one candidate must satisfy the capability set. No candidate may fill two
/// slots. Required slots with no satisfying candidate fail; optional slots
/// stay unbound.
pub fn bind_slots(slots: &[SlotDescriptor], candidates: &[NamedCandidate]) -> Result<SlotTable> {
    let mut bindings = BTreeMap::new();
    let mut used: Vec<bool> = vec![false; candidates.len()];

    for slot in slots {
        let matching: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(i, c)| !used[*i] && slot.is_satisfied_by(&c.handle))
            .map(|(i, _)| i)
            .collect();

        let chosen = match matching
            .iter()
            .find(|&&i| candidates[i].name == slot.name)
        {
            Some(&by_name) => Some(by_name),
            None => match matching.as_slice() {
                [] => None,
                [only] => Some(*only),
                _ => {
                    return Err(PrismError::validation(format!(
                        "slot {} is ambiguous: {} candidates satisfy {}",
                        slot.name,
                        matching.len(),
                        slot.describe()
                    )))
                }
            },
        };

        match chosen {
            Some(i) => {
                used[i] = true;
                bindings.insert(slot.name.clone(), candidates[i].handle.clone());
            }
            None if slot.required => {
                return Err(PrismError::validation(format!(
                    "no candidate satisfies required slot {} (needs {})",
                    slot.name,
                    slot.describe()
                )));
            }
            // Optional slot stays unbound; the pattern runs in its
            // documented degraded mode.
            None => {}
        }
    }

    Ok(SlotTable { bindings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_drivers::{create_driver, DriverSpec};

    fn memory_candidate(name: &str) -> NamedCandidate {
        NamedCandidate {
            name: name.to_string(),
            handle: create_driver(&DriverSpec::new("memory")).unwrap(),
        }
    }

    fn pubsub_only_candidate(name: &str) -> NamedCandidate {
        NamedCandidate {
            name: name.to_string(),
            handle: create_driver(&DriverSpec::new("nats")).unwrap(),
        }
    }

    #[test]
    fn binds_by_name_then_by_capability() {
        let slots = vec![
            SlotDescriptor::required("registry", vec![Capability::KeyValueBasic]),
            SlotDescriptor::required("messaging", vec![Capability::PubSub]),
        ];
        let candidates = vec![memory_candidate("registry"), pubsub_only_candidate("messaging")];
        let table = bind_slots(&slots, &candidates).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.require("messaging").unwrap().name(), "nats");
    }

    #[test]
    fn missing_capability_for_required_slot_fails() {
        let slots = vec![SlotDescriptor::required(
            "registry",
            vec![Capability::KeyValueBasic],
        )];
        let candidates = vec![pubsub_only_candidate("messaging")];
        let err = match bind_slots(&slots, &candidates) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("registry"));
    }

    #[test]
    fn ambiguous_binding_is_rejected() {
        let slots = vec![SlotDescriptor::required(
            "registry",
            vec![Capability::KeyValueBasic],
        )];
        // Two anonymous candidates both satisfy; neither carries the slot name.
        let candidates = vec![memory_candidate("a"), memory_candidate("b")];
        let err = match bind_slots(&slots, &candidates) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn optional_slot_stays_unbound() {
        let slots = vec![
            SlotDescriptor::required("source", vec![Capability::PubSub]),
            SlotDescriptor::optional("state", vec![Capability::KeyValueBasic]),
        ];
        let candidates = vec![pubsub_only_candidate("source")];
        let table = bind_slots(&slots, &candidates).unwrap();
        assert!(table.is_bound("source"));
        assert!(!table.is_bound("state"));
    }

    #[test]
    fn one_of_slot_accepts_either_capability_set() {
        let slot = SlotDescriptor::required_one_of(
            "source",
            vec![vec![Capability::PubSub], vec![Capability::Queue]],
        );
        let table = bind_slots(&[slot.clone()], &[pubsub_only_candidate("source")]).unwrap();
        assert!(table.is_bound("source"));
        // The memory driver satisfies via its Queue capability too.
        let table = bind_slots(&[slot], &[memory_candidate("source")]).unwrap();
        assert!(table.is_bound("source"));
    }

    #[test]
    fn one_candidate_cannot_fill_two_slots() {
        let slots = vec![
            SlotDescriptor::required("registry", vec![Capability::KeyValueBasic]),
            SlotDescriptor::required("messaging", vec![Capability::PubSub]),
        ];
        // A single memory driver satisfies both, but may only be bound once.
        let candidates = vec![memory_candidate("registry")];
        let err = match bind_slots(&slots, &candidates) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("messaging"));
    }
}
