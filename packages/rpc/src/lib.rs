//! # Prism RPC
//!
//! Request/reply framing shared by the launcher control plane, the pattern
//! lifecycle plane, and pattern data planes: one JSON document per line over
//! a TCP connection.
//!
//! - Requests carry a correlation id, method name, parameters, and an
//!   optional deadline which the server honors.
//! - Responses are `ok` or `err`; errors carry the Prism error taxonomy so
//!   classes survive the wire.
//! - Server-push streams (subscriptions, health watches) deliver `item`
//!   frames under the request id until a `done` frame.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{RpcClient, RpcStream};
pub use server::{RpcServer, RpcService};
pub use wire::{Request, Response, WireError};

/// Default per-request deadline when the caller does not set one
pub const DEFAULT_DEADLINE_MS: u64 = 30_000;
