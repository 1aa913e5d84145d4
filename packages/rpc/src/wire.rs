//! Wire format: one JSON document per line.

use std::time::Duration;

use prism_capabilities::{ErrorKind, PrismError};
use serde::{Deserialize, Serialize};

/// A single request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Relative deadline; the server aborts the handler once it elapses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// Taxonomy error as it crosses the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&PrismError> for WireError {
    fn from(e: &PrismError) -> Self {
        WireError {
            kind: e.kind(),
            message: e.to_string(),
            retry_after_ms: e.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

impl From<WireError> for PrismError {
    fn from(w: WireError) -> Self {
        PrismError::from_wire(
            w.kind,
            w.message,
            w.retry_after_ms.map(Duration::from_millis),
        )
    }
}

/// A response or stream frame correlated by request id.
///
/// Exactly one of `ok` / `err` / `item` / `done` is meaningful: unary calls
/// answer with `ok` or `err`; streams emit any number of `item` frames and
/// finish with `done` (or `err`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<WireError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl Response {
    pub fn ok(id: u64, value: serde_json::Value) -> Self {
        Response {
            id,
            ok: Some(value),
            ..Default::default()
        }
    }

    pub fn err(id: u64, e: &PrismError) -> Self {
        Response {
            id,
            err: Some(WireError::from(e)),
            ..Default::default()
        }
    }

    pub fn item(id: u64, value: serde_json::Value) -> Self {
        Response {
            id,
            item: Some(value),
            ..Default::default()
        }
    }

    pub fn done(id: u64) -> Self {
        Response {
            id,
            done: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_survives_the_wire() {
        let e = PrismError::exhausted("pool", Some(Duration::from_secs(2)));
        let wire = WireError::from(&e);
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireError = serde_json::from_str(&json).unwrap();
        let rebuilt: PrismError = back.into();
        assert_eq!(rebuilt.kind(), ErrorKind::CapacityExhausted);
        assert_eq!(rebuilt.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn response_frames_serialize_sparsely() {
        let done = serde_json::to_string(&Response::done(7)).unwrap();
        assert_eq!(done, r#"{"id":7,"done":true}"#);
        let ok = serde_json::to_string(&Response::ok(1, serde_json::json!({"a":1}))).unwrap();
        assert_eq!(ok, r#"{"id":1,"ok":{"a":1}}"#);
    }
}
