//! # Prism Pattern Runtime
//!
//! The in-process contract by which a pattern declares capability slots,
//! gets them bound to drivers, and serves its planes:
//!
//! - [`slots`]: slot descriptors and the binding algorithm.
//! - [`config`]: the pattern configuration model shared by every pattern.
//! - [`runtime`]: the generic host, owning the lifecycle state machine,
//!   the drivers, and the control-plane service.
//! - [`data_plane`]: generic dispatch of capability interfaces over RPC.
//! - [`consumer`]: the Consumer pattern with its message source, retries,
//!   dead-letter, and claim-check resolution.

pub mod config;
pub mod consumer;
pub mod data_plane;
pub mod keyvalue;
pub mod runtime;
pub mod slots;

pub use config::{
    BehaviorConfig, ClaimCheckConfig, DeliveryMode, DurabilityConfig, MessagingConfig,
    PatternConfig,
};
pub use consumer::{
    ClaimCheck, Consumer, ConsumerState, LoggingProcessor, MessageProcessor, CLAIM_CHECK_FLAG,
};
pub use keyvalue::KeyValuePattern;
pub use runtime::{
    InterfaceDeclaration, LifecycleService, PatternBehavior, PatternDescriptor, PatternRuntime,
};
pub use slots::{bind_slots, NamedCandidate, SlotDescriptor, SlotTable};
