//! # Query Module
//!
//! The query expression tree handed to the filter engine.
//!
//! - Queries are immutable once built
//! - Field paths are dotted names walking nested tuple fields
//! - Literals are plain [`Value`]s; type queries take a `Value::Type`

use crate::tuple::{ID_FIELD, TypeRef, Value};
use crate::types::TupleId;

/// Comparison operators supported by `Query::Compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    BeginsWith,
    Contains,
    EndsWith,
    /// Runtime type equals the literal type.
    HasType,
    /// Runtime type is the literal type or a subtype of it.
    HasSubtype,
    /// Declared type equals the literal type.
    HasDeclaredType,
    /// The field path resolves, whatever its value.
    HasField,
}

impl Op {
    /// Ordering operators (`<`, `<=`, `>`, `>=`).
    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual
        )
    }

    /// Substring / subsequence operators.
    #[must_use]
    pub fn is_pattern(self) -> bool {
        matches!(self, Self::BeginsWith | Self::Contains | Self::EndsWith)
    }

    /// Operators taking a type token literal.
    #[must_use]
    pub fn is_type_test(self) -> bool {
        matches!(self, Self::HasType | Self::HasSubtype | Self::HasDeclaredType)
    }
}

/// A query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Matches every tuple.
    Empty,
    Not(Box<Query>),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Compare {
        path: Vec<String>,
        op: Op,
        literal: Value,
    },
}

impl Query {
    /// A comparison against a dotted field path (`"address.city"`).
    #[must_use]
    pub fn compare(path: &str, op: Op, literal: impl Into<Value>) -> Self {
        Self::Compare {
            path: split_path(path),
            op,
            literal: literal.into(),
        }
    }

    #[must_use]
    pub fn eq(path: &str, literal: impl Into<Value>) -> Self {
        Self::compare(path, Op::Equal, literal)
    }

    #[must_use]
    pub fn ne(path: &str, literal: impl Into<Value>) -> Self {
        Self::compare(path, Op::NotEqual, literal)
    }

    /// `id == id`, the shape the filter engine turns into a point lookup.
    #[must_use]
    pub fn id_is(id: TupleId) -> Self {
        Self::eq(ID_FIELD, id)
    }

    #[must_use]
    pub fn has_field(path: &str) -> Self {
        Self::compare(path, Op::HasField, Value::Null)
    }

    #[must_use]
    pub fn has_type(path: &str, ty: TypeRef) -> Self {
        Self::compare(path, Op::HasType, ty)
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Split a dotted path; empty segments are kept so that `"a..b"` fails
/// resolution instead of silently matching `"a.b"`.
fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split('.').map(str::to_string).collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_paths_split() {
        let q = Query::eq("address.city", "Oslo");
        let Query::Compare { path, op, .. } = q else {
            unreachable!("compare expected");
        };
        assert_eq!(path, vec!["address".to_string(), "city".to_string()]);
        assert_eq!(op, Op::Equal);
    }

    #[test]
    fn empty_path_has_no_segments() {
        let Query::Compare { path, .. } = Query::has_field("") else {
            unreachable!("compare expected");
        };
        assert!(path.is_empty());
    }

    #[test]
    fn combinators_nest() {
        let q = Query::eq("a", 1i32).and(Query::eq("b", 2i32).not());
        assert!(matches!(q, Query::And(_, ref rhs) if matches!(**rhs, Query::Not(_))));
    }

    #[test]
    fn operator_classes() {
        assert!(Op::Less.is_ordering());
        assert!(Op::Contains.is_pattern());
        assert!(Op::HasDeclaredType.is_type_test());
        assert!(!Op::HasField.is_type_test());
    }
}
