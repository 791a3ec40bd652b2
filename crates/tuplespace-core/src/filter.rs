//! # Filter Engine
//!
//! Compiles a [`Query`] into an executable predicate tree.
//!
//! Each `Compare` node picks its matching strategy once, at build time, from
//! the category of its literal. At evaluation time the field's own category
//! is checked against the strategy; an incompatible pair evaluates to
//! `false` instead of failing.
//!
//! Building can fail (an ordering operator on an id literal, a pattern
//! operator on an integer, a type test without a type literal). Callers that
//! go through [`Filter::compile`] get a filter that matches nothing in that
//! case, so a malformed query yields an empty result rather than an error.
//!
//! ## Fast path
//!
//! A filter that provably only matches `id == G` carries `G` as its fast
//! path. `And` adopts the id of whichever side has one (or the shared id if
//! both agree); `Or` adopts one only when both sides bind the same id.
//! Storage uses it for a point lookup but still re-checks the full
//! predicate.

use crate::query::{Op, Query};
use crate::tuple::{FieldAccess, ID_FIELD, TypeRef, Value, ValueCategory, resolve_path};
use crate::types::TupleId;
use std::cmp::Ordering;
use thiserror::Error;
use uuid::Uuid;

/// Reasons a query cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("comparison has an empty field path")]
    EmptyPath,

    #[error("operator {op:?} is not defined for {category:?} literals")]
    Unsupported { op: Op, category: ValueCategory },

    #[error("operator {0:?} requires a type literal")]
    NotAType(Op),
}

// =============================================================================
// COMPILED TREE
// =============================================================================

/// Matching strategy of one comparison, chosen from the literal's category.
#[derive(Debug, Clone)]
enum Strategy {
    Integral(i64),
    Floating(f64),
    Text(String),
    Bytes(Vec<u8>),
    Id(Uuid),
    Boolean(bool),
    /// Value equality; covers null and every other category.
    Exact(Value),
    TypeToken(TypeRef),
    Presence,
}

#[derive(Debug, Clone)]
struct Comparison {
    path: Vec<String>,
    op: Op,
    strategy: Strategy,
}

#[derive(Debug, Clone)]
enum Node {
    All,
    Nothing,
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(Comparison),
}

/// A compiled, immutable predicate over tuples.
#[derive(Debug, Clone)]
pub struct Filter {
    root: Node,
    fast_path: Option<TupleId>,
}

impl Filter {
    /// A filter matching every tuple.
    #[must_use]
    pub fn all() -> Self {
        Self {
            root: Node::All,
            fast_path: None,
        }
    }

    /// A filter matching no tuple.
    #[must_use]
    pub fn nothing() -> Self {
        Self {
            root: Node::Nothing,
            fast_path: None,
        }
    }

    /// Compile a query, reporting why it cannot be compiled.
    pub fn build(query: &Query) -> Result<Self, FilterError> {
        let (root, fast_path) = build_node(query)?;
        Ok(Self { root, fast_path })
    }

    /// Compile a query; a query that fails to compile matches nothing.
    #[must_use]
    pub fn compile(query: &Query) -> Self {
        match Self::build(query) {
            Ok(filter) => filter,
            Err(e) => {
                tracing::debug!(error = %e, "query failed to compile, matching nothing");
                Self::nothing()
            }
        }
    }

    /// The single tuple id this filter is restricted to, if provable.
    #[must_use]
    pub fn fast_path(&self) -> Option<TupleId> {
        self.fast_path
    }

    /// Whether this filter can never match.
    #[must_use]
    pub fn is_nothing(&self) -> bool {
        matches!(self.root, Node::Nothing)
    }

    /// Evaluate the predicate against one record.
    pub fn matches<R: FieldAccess + ?Sized>(&self, record: &R) -> bool {
        eval(&self.root, record)
    }
}

// =============================================================================
// BUILD
// =============================================================================

fn build_node(query: &Query) -> Result<(Node, Option<TupleId>), FilterError> {
    match query {
        Query::Empty => Ok((Node::All, None)),
        Query::Not(inner) => {
            let (node, _) = build_node(inner)?;
            Ok((Node::Not(Box::new(node)), None))
        }
        Query::And(lhs, rhs) => {
            let (left, left_id) = build_node(lhs)?;
            let (right, right_id) = build_node(rhs)?;
            let fast_path = match (left_id, right_id) {
                (Some(a), Some(b)) if a == b => Some(a),
                (Some(_), Some(_)) => None,
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            };
            Ok((Node::And(Box::new(left), Box::new(right)), fast_path))
        }
        Query::Or(lhs, rhs) => {
            let (left, left_id) = build_node(lhs)?;
            let (right, right_id) = build_node(rhs)?;
            let fast_path = match (left_id, right_id) {
                (Some(a), Some(b)) if a == b => Some(a),
                _ => None,
            };
            Ok((Node::Or(Box::new(left), Box::new(right)), fast_path))
        }
        Query::Compare { path, op, literal } => {
            if path.is_empty() {
                return Err(FilterError::EmptyPath);
            }
            let strategy = choose_strategy(*op, literal)?;
            let fast_path = match (&strategy, op) {
                (Strategy::Id(id), Op::Equal) if path.len() == 1 && path[0] == ID_FIELD => {
                    Some(TupleId(*id))
                }
                _ => None,
            };
            let comparison = Comparison {
                path: path.clone(),
                op: *op,
                strategy,
            };
            Ok((Node::Compare(comparison), fast_path))
        }
    }
}

fn choose_strategy(op: Op, literal: &Value) -> Result<Strategy, FilterError> {
    if op == Op::HasField {
        return Ok(Strategy::Presence);
    }
    if op.is_type_test() {
        return match literal {
            Value::Type(ty) => Ok(Strategy::TypeToken(ty.clone())),
            _ => Err(FilterError::NotAType(op)),
        };
    }

    let category = literal.category();
    let unsupported = || FilterError::Unsupported { op, category };
    let equality = matches!(op, Op::Equal | Op::NotEqual);

    match literal {
        Value::Char(_) | Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) => {
            if op.is_pattern() {
                return Err(unsupported());
            }
            literal
                .as_i64()
                .map(Strategy::Integral)
                .ok_or_else(unsupported)
        }
        Value::F32(_) | Value::F64(_) => {
            if op.is_pattern() {
                return Err(unsupported());
            }
            literal
                .as_f64()
                .map(Strategy::Floating)
                .ok_or_else(unsupported)
        }
        Value::Str(s) => Ok(Strategy::Text(s.clone())),
        Value::Bytes(b) => Ok(Strategy::Bytes(b.clone())),
        Value::Id(id) if equality => Ok(Strategy::Id(*id)),
        Value::Bool(b) if equality => Ok(Strategy::Boolean(*b)),
        Value::Null | Value::Type(_) | Value::List(_) | Value::Tuple(_) if equality => {
            Ok(Strategy::Exact(literal.clone()))
        }
        _ => Err(unsupported()),
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

fn eval<R: FieldAccess + ?Sized>(node: &Node, record: &R) -> bool {
    match node {
        Node::All => true,
        Node::Nothing => false,
        Node::Not(inner) => !eval(inner, record),
        Node::And(lhs, rhs) => eval(lhs, record) && eval(rhs, record),
        Node::Or(lhs, rhs) => eval(lhs, record) || eval(rhs, record),
        Node::Compare(cmp) => eval_compare(cmp, record),
    }
}

fn eval_compare<R: FieldAccess + ?Sized>(cmp: &Comparison, record: &R) -> bool {
    let Some(view) = resolve_path(record, &cmp.path) else {
        // Only "not equal" holds for an absent field.
        return cmp.op == Op::NotEqual;
    };
    let value = view.value.as_ref();

    match &cmp.strategy {
        Strategy::Presence => true,
        Strategy::TypeToken(ty) => match cmp.op {
            Op::HasDeclaredType => view.declared.as_ref() == ty,
            Op::HasType => value.runtime_type().as_ref() == Some(ty),
            Op::HasSubtype => value.is_instance_of(ty),
            _ => false,
        },
        Strategy::Exact(literal) => match cmp.op {
            Op::Equal => value == literal,
            Op::NotEqual => value != literal,
            _ => false,
        },
        _ if value.is_null() => cmp.op == Op::NotEqual,
        Strategy::Integral(literal) => value
            .as_i64()
            .is_some_and(|field| ordered(cmp.op, field.cmp(literal))),
        Strategy::Floating(literal) => value
            .as_f64()
            .is_some_and(|field| ordered(cmp.op, field.total_cmp(literal))),
        Strategy::Text(literal) => match value {
            Value::Str(field) => match cmp.op {
                Op::BeginsWith => field.starts_with(literal.as_str()),
                Op::Contains => field.contains(literal.as_str()),
                Op::EndsWith => field.ends_with(literal.as_str()),
                op => ordered(op, field.as_str().cmp(literal.as_str())),
            },
            _ => false,
        },
        Strategy::Bytes(literal) => match value {
            Value::Bytes(field) => match cmp.op {
                Op::BeginsWith => field.starts_with(literal),
                Op::Contains => contains_subslice(field, literal),
                Op::EndsWith => field.ends_with(literal),
                // slice order: a true prefix sorts before the longer sequence
                op => ordered(op, field.as_slice().cmp(literal.as_slice())),
            },
            _ => false,
        },
        Strategy::Id(literal) => match value {
            Value::Id(field) => ordered(cmp.op, field.cmp(literal)),
            _ => false,
        },
        Strategy::Boolean(literal) => match value {
            Value::Bool(field) => ordered(cmp.op, field.cmp(literal)),
            _ => false,
        },
    }
}

/// Apply a comparison operator to `field.cmp(literal)`.
fn ordered(op: Op, ord: Ordering) -> bool {
    match op {
        Op::Equal => ord == Ordering::Equal,
        Op::NotEqual => ord != Ordering::Equal,
        Op::Less => ord == Ordering::Less,
        Op::LessOrEqual => ord != Ordering::Greater,
        Op::Greater => ord == Ordering::Greater,
        Op::GreaterOrEqual => ord != Ordering::Less,
        _ => false,
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

// =============================================================================
// TESTS
// =============================================================================
