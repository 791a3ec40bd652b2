//! # Tuple Model
//!
//! Tuples are immutable, uniquely identified records made of ordered,
//! named fields. A field carries a tagged [`Value`] and the [`TypeRef`] it
//! was declared with; the two may differ (a field declared `Any` can hold a
//! string, a field declared `Str` can hold `Null`), which is what separates
//! `HAS_TYPE` from `HAS_DECLARED_TYPE` in the filter engine.
//!
//! Field lookup goes through the [`FieldAccess`] capability so the filter
//! engine never depends on a concrete record layout.

use crate::types::TupleId;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;

/// Name under which every tuple exposes its identifier as a field.
pub const ID_FIELD: &str = "id";

// =============================================================================
// TYPE REFERENCES
// =============================================================================

/// A reference to a value type, usable as a literal in type queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    /// Supertype of every non-null value.
    Any,
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Bytes,
    Id,
    Type,
    List,
    /// A tuple type, by name.
    Named(String),
}

impl TypeRef {
    /// Shorthand for a named tuple type.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// Category of a value, used to pick a matching strategy in the filter engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCategory {
    Null,
    /// All integer widths plus `Char`.
    Integral,
    Floating,
    Text,
    Bytes,
    Id,
    Boolean,
    TypeToken,
    /// Lists and nested tuples.
    Other,
}

/// A tagged field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Id(Uuid),
    Type(TypeRef),
    List(Vec<Value>),
    Tuple(Box<Tuple>),
}

impl Value {
    /// The matching category of this value.
    #[must_use]
    pub fn category(&self) -> ValueCategory {
        match self {
            Self::Null => ValueCategory::Null,
            Self::Char(_) | Self::I8(_) | Self::I16(_) | Self::I32(_) | Self::I64(_) => {
                ValueCategory::Integral
            }
            Self::F32(_) | Self::F64(_) => ValueCategory::Floating,
            Self::Str(_) => ValueCategory::Text,
            Self::Bytes(_) => ValueCategory::Bytes,
            Self::Id(_) => ValueCategory::Id,
            Self::Bool(_) => ValueCategory::Boolean,
            Self::Type(_) => ValueCategory::TypeToken,
            Self::List(_) | Self::Tuple(_) => ValueCategory::Other,
        }
    }

    /// Whether this value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Widen an integral value (any width, or a character) to `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Char(c) => Some(i64::from(u32::from(*c))),
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Widen a floating value to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// The runtime type of this value; `None` for `Null`.
    #[must_use]
    pub fn runtime_type(&self) -> Option<TypeRef> {
        let ty = match self {
            Self::Null => return None,
            Self::Bool(_) => TypeRef::Bool,
            Self::Char(_) => TypeRef::Char,
            Self::I8(_) => TypeRef::I8,
            Self::I16(_) => TypeRef::I16,
            Self::I32(_) => TypeRef::I32,
            Self::I64(_) => TypeRef::I64,
            Self::F32(_) => TypeRef::F32,
            Self::F64(_) => TypeRef::F64,
            Self::Str(_) => TypeRef::Str,
            Self::Bytes(_) => TypeRef::Bytes,
            Self::Id(_) => TypeRef::Id,
            Self::Type(_) => TypeRef::Type,
            Self::List(_) => TypeRef::List,
            Self::Tuple(t) => TypeRef::Named(t.type_name.clone()),
        };
        Some(ty)
    }

    /// Whether the runtime type of this value is `ty` or a subtype of it.
    ///
    /// `Null` has no runtime type and is a subtype of nothing.
    #[must_use]
    pub fn is_instance_of(&self, ty: &TypeRef) -> bool {
        let Some(actual) = self.runtime_type() else {
            return false;
        };
        if *ty == TypeRef::Any || actual == *ty {
            return true;
        }
        match (self, ty) {
            (Self::Tuple(t), TypeRef::Named(name)) => t.supertypes.iter().any(|s| s == name),
            _ => false,
        }
    }

    /// The type a field holding this value is declared with by default.
    fn default_declared_type(&self) -> TypeRef {
        self.runtime_type().unwrap_or(TypeRef::Any)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool,
    char => Char,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => Str,
    Vec<u8> => Bytes,
    Uuid => Id,
    TypeRef => Type,
    Vec<Value> => List,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<TupleId> for Value {
    fn from(v: TupleId) -> Self {
        Self::Id(v.0)
    }
}

impl From<Tuple> for Value {
    fn from(v: Tuple) -> Self {
        Self::Tuple(Box::new(v))
    }
}

// =============================================================================
// TUPLE
// =============================================================================

/// One named field of a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub declared: TypeRef,
    pub value: Value,
}

/// An immutable, uniquely identified structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    id: TupleId,
    type_name: String,
    supertypes: Vec<String>,
    fields: Vec<Field>,
}

impl Tuple {
    /// Start building a tuple of the given type.
    #[must_use]
    pub fn builder(type_name: impl Into<String>) -> TupleBuilder {
        TupleBuilder {
            id: None,
            type_name: type_name.into(),
            supertypes: Vec::new(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TupleId {
        self.id
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Declared supertypes of this tuple's type, nearest first.
    #[must_use]
    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// A copy of this tuple carrying a different identifier.
    #[must_use]
    pub fn with_id(&self, id: TupleId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

/// Builder for [`Tuple`].
#[derive(Debug, Clone)]
pub struct TupleBuilder {
    id: Option<TupleId>,
    type_name: String,
    supertypes: Vec<String>,
    fields: Vec<Field>,
}

impl TupleBuilder {
    /// Use an explicit identifier instead of a fresh one.
    #[must_use]
    pub fn id(mut self, id: TupleId) -> Self {
        self.id = Some(id);
        self
    }

    /// Declare a supertype of this tuple's type.
    #[must_use]
    pub fn supertype(mut self, name: impl Into<String>) -> Self {
        self.supertypes.push(name.into());
        self
    }

    /// Add a field declared with the runtime type of its value
    /// (`Any` for `Null`).
    #[must_use]
    pub fn field(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let declared = value.default_declared_type();
        self.declared_field(name, declared, value)
    }

    /// Add a field with an explicit declared type.
    ///
    /// A field named `id` is stored but shadowed by the tuple identifier
    /// on lookup.
    #[must_use]
    pub fn declared_field(
        mut self,
        name: impl Into<String>,
        declared: TypeRef,
        value: impl Into<Value>,
    ) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == name) {
            existing.declared = declared;
            existing.value = value;
        } else {
            self.fields.push(Field {
                name,
                declared,
                value,
            });
        }
        self
    }

    #[must_use]
    pub fn build(self) -> Tuple {
        Tuple {
            id: self.id.unwrap_or_else(TupleId::new_v4),
            type_name: self.type_name,
            supertypes: self.supertypes,
            fields: self.fields,
        }
    }
}

// =============================================================================
// FIELD ACCESS
// =============================================================================

/// A resolved field: its value and its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldView<'a> {
    pub value: Cow<'a, Value>,
    pub declared: Cow<'a, TypeRef>,
}

/// Polymorphic field lookup over a record.
pub trait FieldAccess {
    /// Look up a field by name. `None` means the field is absent.
    fn field(&self, name: &str) -> Option<FieldView<'_>>;

    fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    fn declared_type(&self, name: &str) -> Option<TypeRef> {
        self.field(name).map(|f| f.declared.into_owned())
    }
}

impl FieldAccess for Tuple {
    fn field(&self, name: &str) -> Option<FieldView<'_>> {
        if name == ID_FIELD {
            return Some(FieldView {
                value: Cow::Owned(Value::Id(self.id.0)),
                declared: Cow::Owned(TypeRef::Id),
            });
        }
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| FieldView {
                value: Cow::Borrowed(&f.value),
                declared: Cow::Borrowed(&f.declared),
            })
    }
}

/// Resolve a dotted field path against a record.
///
/// Every segment but the last must name a tuple-valued field; anything else
/// (missing field, non-tuple intermediate, null intermediate) resolves to
/// "absent".
pub fn resolve_path<'a, R: FieldAccess + ?Sized>(
    record: &'a R,
    path: &[String],
) -> Option<FieldView<'a>> {
    let (last, parents) = path.split_last()?;
    let Some((first, rest)) = parents.split_first() else {
        return record.field(last);
    };

    let mut current: &'a Tuple = nested(record.field(first)?)?;
    for segment in rest {
        current = nested(current.field(segment)?)?;
    }
    current.field(last)
}

fn nested(view: FieldView<'_>) -> Option<&Tuple> {
    match view.value {
        Cow::Borrowed(Value::Tuple(inner)) => Some(&**inner),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
