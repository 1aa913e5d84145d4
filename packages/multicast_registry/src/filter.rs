//! Typed predicate tree over identity metadata.
//!
//! Evaluation is pure and type-strict: comparing values of different types
//! is false, never a coercion, and a missing field makes every predicate
//! except `Exists` (and the children of `Not`) false. Depth and clause
//! count are bounded before evaluation to keep pathological expressions
//! out.

use std::cmp::Ordering;

use prism_capabilities::{Metadata, PrismError, Result, Value};
use serde::{Deserialize, Serialize};

/// A filter node. Filters are plain values with no backend binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Equality { field: String, value: Value },
    NotEqual { field: String, value: Value },
    LessThan { field: String, value: Value },
    LessOrEqual { field: String, value: Value },
    GreaterThan { field: String, value: Value },
    GreaterOrEqual { field: String, value: Value },
    StartsWith { field: String, value: String },
    EndsWith { field: String, value: String },
    Contains { field: String, value: String },
    Exists { field: String },
    And { children: Vec<Filter> },
    Or { children: Vec<Filter> },
    Not { child: Box<Filter> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equality {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists {
            field: field.into(),
        }
    }

    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And { children }
    }

    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or { children }
    }

    pub fn not(child: Filter) -> Self {
        Filter::Not {
            child: Box::new(child),
        }
    }

    /// Pure evaluation against one identity's metadata
    pub fn evaluate(&self, metadata: &Metadata) -> bool {
        match self {
            Filter::Equality { field, value } => metadata.get(field) == Some(value),
            Filter::NotEqual { field, value } => match metadata.get(field) {
                // Type mismatch is false, not "not equal".
                Some(actual) if actual.type_name() == value.type_name() => actual != value,
                _ => false,
            },
            Filter::LessThan { field, value } => {
                Self::compare(metadata, field, value, &[Ordering::Less])
            }
            Filter::LessOrEqual { field, value } => {
                Self::compare(metadata, field, value, &[Ordering::Less, Ordering::Equal])
            }
            Filter::GreaterThan { field, value } => {
                Self::compare(metadata, field, value, &[Ordering::Greater])
            }
            Filter::GreaterOrEqual { field, value } => Self::compare(
                metadata,
                field,
                value,
                &[Ordering::Greater, Ordering::Equal],
            ),
            Filter::StartsWith { field, value } => Self::string_field(metadata, field)
                .map(|s| s.starts_with(value.as_str()))
                .unwrap_or(false),
            Filter::EndsWith { field, value } => Self::string_field(metadata, field)
                .map(|s| s.ends_with(value.as_str()))
                .unwrap_or(false),
            // An empty substring is contained in everything.
            Filter::Contains { field, value } => Self::string_field(metadata, field)
                .map(|s| s.contains(value.as_str()))
                .unwrap_or(false),
            Filter::Exists { field } => metadata.contains_key(field),
            Filter::And { children } => children.iter().all(|c| c.evaluate(metadata)),
            Filter::Or { children } => children.iter().any(|c| c.evaluate(metadata)),
            Filter::Not { child } => !child.evaluate(metadata),
        }
    }

    fn compare(metadata: &Metadata, field: &str, value: &Value, accept: &[Ordering]) -> bool {
        metadata
            .get(field)
            .and_then(|actual| actual.partial_cmp_strict(value))
            .map(|ordering| accept.contains(&ordering))
            .unwrap_or(false)
    }

    fn string_field<'m>(metadata: &'m Metadata, field: &str) -> Option<&'m str> {
        metadata.get(field).and_then(Value::as_str)
    }

    /// Nesting depth; a leaf is depth 1
    pub fn depth(&self) -> usize {
        match self {
            Filter::And { children } | Filter::Or { children } => {
                1 + children.iter().map(Filter::depth).max().unwrap_or(0)
            }
            Filter::Not { child } => 1 + child.depth(),
            _ => 1,
        }
    }

    /// Number of leaf predicates
    pub fn clause_count(&self) -> usize {
        match self {
            Filter::And { children } | Filter::Or { children } => {
                children.iter().map(Filter::clause_count).sum()
            }
            Filter::Not { child } => child.clause_count(),
            _ => 1,
        }
    }

    /// Enforce configured bounds before a filter is evaluated
    pub fn validate(&self, max_depth: usize, max_clauses: usize) -> Result<()> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(PrismError::validation(format!(
                "filter depth {depth} exceeds the limit of {max_depth}"
            )));
        }
        let clauses = self.clause_count();
        if clauses > max_clauses {
            return Err(PrismError::validation(format!(
                "filter has {clauses} clauses, the limit is {max_clauses}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metadata(entries: &[(&str, Value)]) -> Metadata {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_is_type_strict() {
        let m = metadata(&[("port", Value::Int(80))]);
        assert!(Filter::eq("port", 80i64).evaluate(&m));
        assert!(!Filter::eq("port", "80").evaluate(&m));
        assert!(!Filter::eq("port", 80.0).evaluate(&m));
    }

    #[test]
    fn missing_field_fails_every_predicate_but_exists() {
        let m = Metadata::new();
        assert!(!Filter::eq("x", 1i64).evaluate(&m));
        assert!(!Filter::NotEqual {
            field: "x".into(),
            value: Value::Int(1)
        }
        .evaluate(&m));
        assert!(!Filter::GreaterThan {
            field: "x".into(),
            value: Value::Int(0)
        }
        .evaluate(&m));
        assert!(!Filter::Contains {
            field: "x".into(),
            value: String::new()
        }
        .evaluate(&m));
        assert!(!Filter::exists("x").evaluate(&m));
        // Not flips the missing-field false.
        assert!(Filter::not(Filter::exists("x")).evaluate(&m));
    }

    #[test]
    fn ordering_comparisons_respect_types() {
        let m = metadata(&[("score", Value::Float(2.5)), ("name", Value::Str("bob".into()))]);
        assert!(Filter::GreaterThan {
            field: "score".into(),
            value: Value::Float(2.0)
        }
        .evaluate(&m));
        assert!(!Filter::GreaterThan {
            field: "score".into(),
            value: Value::Int(2)
        }
        .evaluate(&m));
        assert!(Filter::LessOrEqual {
            field: "name".into(),
            value: Value::Str("bob".into())
        }
        .evaluate(&m));
    }

    #[test]
    fn contains_with_empty_substring_is_true() {
        let m = metadata(&[("name", Value::Str("alice".into()))]);
        assert!(Filter::Contains {
            field: "name".into(),
            value: String::new()
        }
        .evaluate(&m));
    }

    #[test]
    fn string_predicates_on_non_string_fields_are_false() {
        let m = metadata(&[("n", Value::Int(42))]);
        assert!(!Filter::StartsWith {
            field: "n".into(),
            value: "4".into()
        }
        .evaluate(&m));
    }

    #[test]
    fn and_or_combinators() {
        let m = metadata(&[
            ("status", Value::Str("online".into())),
            ("room", Value::Str("eng".into())),
        ]);
        let f = Filter::and(vec![
            Filter::eq("status", "online"),
            Filter::eq("room", "eng"),
        ]);
        assert!(f.evaluate(&m));
        let f = Filter::or(vec![Filter::eq("room", "sales"), Filter::eq("room", "eng")]);
        assert!(f.evaluate(&m));
        assert!(Filter::and(vec![]).evaluate(&m));
        assert!(!Filter::or(vec![]).evaluate(&m));
    }

    fn nested_and(levels: usize) -> Filter {
        let mut f = Filter::eq("x", 1i64);
        for _ in 1..levels {
            f = Filter::and(vec![f]);
        }
        f
    }

    #[test]
    fn depth_guard_is_exact() {
        assert!(nested_and(5).validate(5, 100).is_ok());
        let err = nested_and(6).validate(5, 100).unwrap_err();
        assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
    }

    #[test]
    fn clause_guard_counts_leaves() {
        let f = Filter::and(vec![Filter::eq("a", 1i64), Filter::eq("b", 2i64)]);
        assert_eq!(f.clause_count(), 2);
        assert!(f.validate(5, 2).is_ok());
        assert!(f.validate(5, 1).is_err());
    }

    #[test]
    fn serde_shape_is_tagged() {
        let f = Filter::eq("status", "online");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["op"], "equality");
        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, f);
    }

    prop_compose! {
        fn arb_value()(choice in 0..4, i in any::<i64>(), f in any::<f64>(), s in "[a-z]{0,8}") -> Value {
            match choice {
                0 => Value::Int(i),
                1 => Value::Float(f),
                2 => Value::Str(s),
                _ => Value::Bool(i % 2 == 0),
            }
        }
    }

    proptest! {
        // Evaluation is pure: same inputs, same answer, regardless of order.
        #[test]
        fn evaluation_is_pure(v in arb_value(), w in arb_value()) {
            let m = metadata(&[("a", v)]);
            let f = Filter::Equality { field: "a".into(), value: w };
            let first = f.evaluate(&m);
            for _ in 0..3 {
                prop_assert_eq!(f.evaluate(&m), first);
            }
        }

        // A value always equals itself under the strict semantics, except NaN.
        #[test]
        fn equality_is_reflexive_for_non_nan(v in arb_value()) {
            prop_assume!(!matches!(&v, Value::Float(f) if f.is_nan()));
            let m = metadata(&[("a", v.clone())]);
            let f = Filter::Equality { field: "a".into(), value: v };
            prop_assert!(f.evaluate(&m));
        }
    }
}
