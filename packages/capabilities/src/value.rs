//! Scalar metadata values.
//!
//! Identity metadata and filter operands are scalars: string, int, float, or
//! bool. Comparisons are type-strict: an `Int` never equals a `Float` or a
//! `Str`, and ordering across types is undefined.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata attached to an identity: field name to scalar value
pub type Metadata = BTreeMap<String, Value>;

/// A scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Type name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Ordering comparison, defined only between values of the same type.
    /// Bools are unordered; NaN floats compare as unordered.
    pub fn partial_cmp_strict(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_type_strict() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Str("1".into()));
        assert_eq!(Value::Int(1), Value::Int(1));
    }

    #[test]
    fn ordering_is_type_strict() {
        assert_eq!(
            Value::Int(1).partial_cmp_strict(&Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).partial_cmp_strict(&Value::Float(2.0)), None);
        assert_eq!(Value::Bool(false).partial_cmp_strict(&Value::Bool(true)), None);
    }

    #[test]
    fn serde_round_trip_preserves_type() {
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Int(42));
        let v: Value = serde_json::from_str("42.5").unwrap();
        assert_eq!(v, Value::Float(42.5));
        let v: Value = serde_json::from_str("\"online\"").unwrap();
        assert_eq!(v, Value::Str("online".into()));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
    }
}
