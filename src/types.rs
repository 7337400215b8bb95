use crate::error::{RepoError, Result};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum ColumnType {
    Boolean,
    Varchar,
    Double,
    Integer,
    Geometry,
}

#[derive(Clone, Debug)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub not_null: bool,
}

pub(crate) struct ColumnSpecs {
    pub(crate) primary_key: String,
    pub(crate) other_columns: Vec<ColumnSpec>,
}

/// Dynamic value for a single column, mirroring SQLite's own dynamic typing.
///
/// Every column except the geometry column round-trips through JSON when it
/// crosses the boundary into a blob (see `workingcopy::meta` and
/// `workingcopy::commit`); the geometry column instead carries raw GPB bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*r)),
            Value::Text(t) => ToSqlOutput::Owned(rusqlite::types::Value::Text(t.clone())),
            Value::Blob(b) => ToSqlOutput::Owned(rusqlite::types::Value::Blob(b.clone())),
        })
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl TryFrom<Value> for String {
    type Error = RepoError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Text(t) => Ok(t),
            other => Err(RepoError::ValueTypeMismatch {
                expected: "text",
                actual: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = RepoError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i),
            other => Err(RepoError::ValueTypeMismatch {
                expected: "integer",
                actual: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = RepoError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i != 0),
            other => Err(RepoError::ValueTypeMismatch {
                expected: "boolean",
                actual: other.kind_name(),
            }),
        }
    }
}

impl Value {
    fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    /// Encode as the JSON representation stored in a non-geometry feature blob.
    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(t) => serde_json::Value::String(t.clone()),
            Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
        }
    }

    /// Decode a JSON value read back from a non-geometry feature blob, typed
    /// against the declared column type.
    pub(crate) fn from_json(value: &serde_json::Value, column_type: ColumnType) -> Result<Self> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        Ok(match column_type {
            ColumnType::Boolean | ColumnType::Integer => Value::Integer(
                value
                    .as_i64()
                    .ok_or_else(|| RepoError::Message(format!("expected integer, got {value}")))?,
            ),
            ColumnType::Double => Value::Real(
                value
                    .as_f64()
                    .ok_or_else(|| RepoError::Message(format!("expected number, got {value}")))?,
            ),
            ColumnType::Varchar => Value::Text(
                value
                    .as_str()
                    .ok_or_else(|| RepoError::Message(format!("expected string, got {value}")))?
                    .to_string(),
            ),
            ColumnType::Geometry => {
                return Err(RepoError::Message(
                    "geometry columns are not JSON-encoded".to_string(),
                ));
            }
        })
    }
}
