//! Typed attribute values and their conversions to and from the engine's
//! native representation (the Row Materializer / Binder).
//!
//! The round-trip law holds for every supported semantic type: for a legal
//! value `v` of attribute type `t`, `materialize(bind(v, t), t) == v`.
//!
//! # Encoding rules
//!
//! - `Date` is stored as an INTEGER count of milliseconds since the Unix
//!   epoch, so comparisons in SQL order chronologically.
//! - `Boolean` is stored as INTEGER 0/1; any other integer fails decoding as
//!   `CorruptRow` rather than being coerced.
//! - `Transformable` attributes round-trip through the caller-supplied
//!   [`ValueTransformer`]; the store treats the bytes as opaque.

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;

use crate::error::StoreError;
use crate::model::{AttributeDescriptor, AttributeType, ValueTransformer};

/// A typed attribute value as seen by callers of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Binary(Vec<u8>),
}

impl Value {
    /// Type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::Binary(_) => "binary",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Bind values are passed positionally to prepared statements; this impl is
/// what lets a compiled statement's binding list go straight into rusqlite's
/// `params_from_iter`.
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Date(ms) => ToSqlOutput::Owned(SqlValue::Integer(*ms)),
            Value::Binary(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Convert a typed value into the engine's native form for the given
/// attribute, applying the attribute's transformer for transformable types.
///
/// `Null` is accepted for optional attributes; a `Null` for a required
/// attribute or a value whose variant does not match the attribute type fails
/// with [`StoreError::UnsupportedQuery`].
pub fn bind(value: &Value, attr: &AttributeDescriptor) -> Result<Value, StoreError> {
    if value.is_null() {
        if attr.optional {
            return Ok(Value::Null);
        }
        return Err(type_error(attr, value));
    }

    match (attr.attr_type, value) {
        (AttributeType::String, Value::String(_))
        | (AttributeType::Integer, Value::Integer(_))
        | (AttributeType::Float, Value::Float(_))
        | (AttributeType::Boolean, Value::Boolean(_))
        | (AttributeType::Date, Value::Date(_))
        | (AttributeType::Binary, Value::Binary(_)) => Ok(value.clone()),
        (AttributeType::Transformable, v) => {
            let transformer = required_transformer(attr)?;
            Ok(Value::Binary(transformer.encode(v)?))
        }
        _ => Err(type_error(attr, value)),
    }
}

/// Convert a native result-cell back into the typed value declared by the
/// attribute descriptor.
///
/// A NULL column materializes [`Value::Null`]; any value that cannot be
/// decoded under the declared type fails with [`StoreError::CorruptRow`]
/// rather than producing a wrong value silently.
pub fn materialize(raw: ValueRef<'_>, attr: &AttributeDescriptor) -> Result<Value, StoreError> {
    match (attr.attr_type, raw) {
        (_, ValueRef::Null) => Ok(Value::Null),
        (AttributeType::String, ValueRef::Text(bytes)) => {
            let s = std::str::from_utf8(bytes).map_err(|e| corrupt(attr, &e.to_string()))?;
            Ok(Value::String(s.to_string()))
        }
        (AttributeType::Integer, ValueRef::Integer(i)) => Ok(Value::Integer(i)),
        (AttributeType::Float, ValueRef::Real(f)) => Ok(Value::Float(f)),
        (AttributeType::Float, ValueRef::Integer(i)) => Ok(Value::Float(i as f64)),
        (AttributeType::Boolean, ValueRef::Integer(0)) => Ok(Value::Boolean(false)),
        (AttributeType::Boolean, ValueRef::Integer(1)) => Ok(Value::Boolean(true)),
        (AttributeType::Date, ValueRef::Integer(ms)) => Ok(Value::Date(ms)),
        (AttributeType::Binary, ValueRef::Blob(bytes)) => Ok(Value::Binary(bytes.to_vec())),
        (AttributeType::Transformable, ValueRef::Blob(bytes)) => {
            required_transformer(attr)?.decode(bytes)
        }
        (_, other) => Err(corrupt(
            attr,
            &format!("stored value has native type {}", native_type_name(other)),
        )),
    }
}

fn required_transformer(
    attr: &AttributeDescriptor,
) -> Result<&dyn ValueTransformer, StoreError> {
    attr.transformer
        .as_deref()
        .ok_or_else(|| StoreError::SchemaMismatch {
            message: format!("transformable attribute '{}' has no transformer", attr.name),
        })
}

fn type_error(attr: &AttributeDescriptor, value: &Value) -> StoreError {
    StoreError::UnsupportedQuery {
        message: format!(
            "value of type {} is not valid for attribute '{}' ({:?}{})",
            value.type_name(),
            attr.name,
            attr.attr_type,
            if attr.optional { "" } else { ", required" }
        ),
    }
}

fn corrupt(attr: &AttributeDescriptor, detail: &str) -> StoreError {
    StoreError::CorruptRow {
        message: format!(
            "attribute '{}' declared {:?}: {}",
            attr.name, attr.attr_type, detail
        ),
    }
}

fn native_type_name(raw: ValueRef<'_>) -> &'static str {
    match raw {
        ValueRef::Null => "NULL",
        ValueRef::Integer(_) => "INTEGER",
        ValueRef::Real(_) => "REAL",
        ValueRef::Text(_) => "TEXT",
        ValueRef::Blob(_) => "BLOB",
    }
}
