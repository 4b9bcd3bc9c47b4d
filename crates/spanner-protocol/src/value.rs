//! Wire values and the narrow codec interface.
//!
//! Column values travel as [`Value`]s described by a [`Type`]. Marshalling
//! between Rust types and wire values is reduced to two traits, [`Encode`]
//! and [`Decode`]; the session and transaction runtime never looks inside a
//! value except to size it and to merge chunked continuations.

use bytes::Bytes;

use crate::error::ProtocolError;

/// A value as sent over the wire.
///
/// Integer columns are carried as [`Value::Int64`]; timestamps, dates and
/// numerics are carried as their canonical string form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL.
    Null,
    /// BOOL.
    Bool(bool),
    /// INT64.
    Int64(i64),
    /// FLOAT64.
    Float64(f64),
    /// STRING and string-encoded scalar types.
    String(String),
    /// BYTES.
    Bytes(Bytes),
    /// ARRAY and STRUCT.
    List(Vec<Value>),
}

impl Value {
    /// Check if the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Name of the value kind, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
        }
    }

    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 2,
            Self::Int64(_) | Self::Float64(_) => 9,
            Self::String(s) => s.len() + 2,
            Self::Bytes(b) => b.len() + 2,
            Self::List(items) => items.iter().map(Value::encoded_len).sum::<usize>() + 2,
        }
    }

    /// Merge this (chunked) value with its continuation from the next
    /// partial result set.
    ///
    /// Strings and bytes concatenate. Lists concatenate, merging the last
    /// element of `self` with the first element of `next` when both are
    /// themselves mergeable.
    pub fn merge_chunk(self, next: Value) -> Result<Value, ProtocolError> {
        match (self, next) {
            (Self::String(mut a), Self::String(b)) => {
                a.push_str(&b);
                Ok(Self::String(a))
            }
            (Self::Bytes(a), Self::Bytes(b)) => {
                let mut merged = Vec::with_capacity(a.len() + b.len());
                merged.extend_from_slice(&a);
                merged.extend_from_slice(&b);
                Ok(Self::Bytes(Bytes::from(merged)))
            }
            (Self::List(mut a), Self::List(b)) => {
                let mut rest = b.into_iter();
                match (a.pop(), rest.next()) {
                    (Some(last), Some(first)) if last.is_mergeable() && first.is_mergeable() => {
                        a.push(last.merge_chunk(first)?);
                    }
                    (last, first) => {
                        a.extend(last);
                        a.extend(first);
                    }
                }
                a.extend(rest);
                Ok(Self::List(a))
            }
            (a, b) => Err(ProtocolError::ChunkMerge(format!(
                "incompatible kinds {} and {}",
                a.kind_name(),
                b.kind_name()
            ))),
        }
    }

    fn is_mergeable(&self) -> bool {
        matches!(self, Self::String(_) | Self::Bytes(_) | Self::List(_))
    }
}

/// Column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// BOOL.
    Bool,
    /// INT64.
    Int64,
    /// FLOAT64.
    Float64,
    /// STRING.
    String,
    /// BYTES.
    Bytes,
    /// TIMESTAMP.
    Timestamp,
    /// DATE.
    Date,
    /// NUMERIC.
    Numeric,
    /// JSON.
    Json,
    /// ARRAY.
    Array,
    /// STRUCT.
    Struct,
}

/// A column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    /// Type code.
    pub code: TypeCode,
    /// Element type for arrays.
    pub array_element: Option<Box<Type>>,
    /// Fields for structs.
    pub struct_fields: Vec<Field>,
}

impl Type {
    /// A scalar type.
    #[must_use]
    pub fn scalar(code: TypeCode) -> Self {
        Self {
            code,
            array_element: None,
            struct_fields: Vec::new(),
        }
    }

    /// An array of `element`.
    #[must_use]
    pub fn array(element: Type) -> Self {
        Self {
            code: TypeCode::Array,
            array_element: Some(Box::new(element)),
            struct_fields: Vec::new(),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Column type.
    pub ty: Type,
}

impl Field {
    /// Create a field.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Convert a Rust value into a wire value.
pub trait Encode {
    /// Encode `self`.
    fn encode(&self) -> Value;
}

/// Convert a wire value of a known type into a Rust value.
pub trait Decode: Sized {
    /// Decode `value`, which has column type `ty`.
    fn decode(value: &Value, ty: &Type) -> Result<Self, ProtocolError>;
}

fn mismatch(expected: &'static str, value: &Value) -> ProtocolError {
    match value {
        Value::Null => ProtocolError::UnexpectedNull,
        other => ProtocolError::TypeMismatch {
            expected,
            actual: other.kind_name().to_string(),
        },
    }
}

impl Encode for Value {
    fn encode(&self) -> Value {
        self.clone()
    }
}

impl Decode for Value {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        Ok(value.clone())
    }
}

impl Encode for bool {
    fn encode(&self) -> Value {
        Value::Bool(*self)
    }
}

impl Decode for bool {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl Encode for i64 {
    fn encode(&self) -> Value {
        Value::Int64(*self)
    }
}

impl Decode for i64 {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        match value {
            Value::Int64(v) => Ok(*v),
            Value::String(s) => s.parse().map_err(|_| ProtocolError::InvalidValue {
                type_name: "INT64",
                value: s.clone(),
            }),
            other => Err(mismatch("int64", other)),
        }
    }
}

impl Encode for f64 {
    fn encode(&self) -> Value {
        Value::Float64(*self)
    }
}

impl Decode for f64 {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        match value {
            Value::Float64(v) => Ok(*v),
            Value::Int64(v) => Ok(*v as f64),
            other => Err(mismatch("float64", other)),
        }
    }
}

impl Encode for String {
    fn encode(&self) -> Value {
        Value::String(self.clone())
    }
}

impl Encode for &str {
    fn encode(&self) -> Value {
        Value::String((*self).to_string())
    }
}

impl Decode for String {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(mismatch("string", other)),
        }
    }
}

impl Encode for Bytes {
    fn encode(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl Decode for Bytes {
    fn decode(value: &Value, _ty: &Type) -> Result<Self, ProtocolError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self) -> Value {
        match self {
            Some(v) => v.encode(),
            None => Value::Null,
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(value: &Value, ty: &Type) -> Result<Self, ProtocolError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::decode(value, ty).map(Some)
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self) -> Value {
        Value::List(self.iter().map(Encode::encode).collect())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(value: &Value, ty: &Type) -> Result<Self, ProtocolError> {
        let element = ty
            .array_element
            .as_deref()
            .ok_or_else(|| ProtocolError::TypeMismatch {
                expected: "array",
                actual: format!("{:?}", ty.code),
            })?;
        match value {
            Value::List(items) => items.iter().map(|v| T::decode(v, element)).collect(),
            other => Err(mismatch("list", other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_strings() {
        let merged = Value::String("foo".into())
            .merge_chunk(Value::String("bar".into()))
            .unwrap();
        assert_eq!(merged, Value::String("foobar".into()));
    }

    #[test]
    fn test_merge_nested_lists() {
        let a = Value::List(vec![Value::Int64(1), Value::String("ab".into())]);
        let b = Value::List(vec![Value::String("cd".into()), Value::Int64(2)]);
        let merged = a.merge_chunk(b).unwrap();
        assert_eq!(
            merged,
            Value::List(vec![
                Value::Int64(1),
                Value::String("abcd".into()),
                Value::Int64(2)
            ])
        );
    }

    #[test]
    fn test_merge_list_with_scalar_tail_appends() {
        let a = Value::List(vec![Value::Int64(1)]);
        let b = Value::List(vec![Value::Int64(2)]);
        assert_eq!(
            a.merge_chunk(b).unwrap(),
            Value::List(vec![Value::Int64(1), Value::Int64(2)])
        );
    }

    #[test]
    fn test_merge_incompatible() {
        let err = Value::Bool(true).merge_chunk(Value::Bool(false)).unwrap_err();
        assert!(matches!(err, ProtocolError::ChunkMerge(_)));
    }

    #[test]
    fn test_decode_int64_from_string() {
        let ty = Type::scalar(TypeCode::Int64);
        assert_eq!(i64::decode(&Value::String("42".into()), &ty).unwrap(), 42);
        assert!(i64::decode(&Value::String("x".into()), &ty).is_err());
    }

    #[test]
    fn test_decode_null() {
        let ty = Type::scalar(TypeCode::String);
        assert_eq!(Option::<String>::decode(&Value::Null, &ty).unwrap(), None);
        assert_eq!(
            String::decode(&Value::Null, &ty).unwrap_err(),
            ProtocolError::UnexpectedNull
        );
    }

    #[test]
    fn test_decode_array() {
        let ty = Type::array(Type::scalar(TypeCode::Int64));
        let value = Value::List(vec![Value::Int64(1), Value::Int64(2)]);
        assert_eq!(Vec::<i64>::decode(&value, &ty).unwrap(), vec![1, 2]);
    }
}
