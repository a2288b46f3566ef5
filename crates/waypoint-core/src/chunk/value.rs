//! Scalar values and column data types

use crate::error::{Error, Result};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported column data types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit signed integer
    Int64,
    /// 64-bit float
    Float64,
    /// Boolean
    Bool,
    /// UTF-8 string
    Utf8,
}

impl DataType {
    /// Payload stored under a null position.
    ///
    /// Null positions are marked in the column null bitmap; the payload slot
    /// holds this value so fixed-width readers never see garbage.
    pub fn zero(self) -> Value {
        match self {
            DataType::Int64 => Value::Int64(0),
            DataType::Float64 => Value::Float64(0.0),
            DataType::Bool => Value::Bool(false),
            DataType::Utf8 => Value::Utf8(String::new()),
        }
    }

    /// Encoded width for fixed-size types
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::Int64 | DataType::Float64 => Some(8),
            DataType::Bool => Some(1),
            DataType::Utf8 => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::Bool => "Bool",
            DataType::Utf8 => "Utf8",
        };
        f.write_str(name)
    }
}

/// A single cell value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL-style null
    Null,
    /// Integer value
    Int64(i64),
    /// Float value
    Float64(f64),
    /// Boolean value
    Bool(bool),
    /// String value
    Utf8(String),
}

impl Value {
    /// Data type of a non-null value
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Bool(_) => Some(DataType::Bool),
            Value::Utf8(_) => Some(DataType::Utf8),
        }
    }

    /// True for [`Value::Null`]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// String view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Append the value's byte encoding. Null encodes as nothing.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => {}
            Value::Int64(v) => buf.put_i64_le(*v),
            Value::Float64(v) => buf.put_u64_le(v.to_bits()),
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Utf8(s) => buf.put_slice(s.as_bytes()),
        }
    }

    /// Decode bytes produced by [`Value::encode`]
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Value> {
        if let Some(width) = data_type.fixed_width() {
            if bytes.len() != width {
                return Err(Error::record(format!(
                    "{data_type} field has {} bytes, expected {width}",
                    bytes.len()
                )));
            }
        }
        let value = match data_type {
            DataType::Int64 => Value::Int64(i64::from_le_bytes(fixed8(bytes)?)),
            DataType::Float64 => Value::Float64(f64::from_bits(u64::from_le_bytes(fixed8(bytes)?))),
            DataType::Bool => Value::Bool(bytes[0] != 0),
            DataType::Utf8 => Value::Utf8(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::record(format!("invalid UTF-8 string: {e}")))?,
            ),
        };
        Ok(value)
    }
}

fn fixed8(bytes: &[u8]) -> Result<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| Error::record("expected 8 bytes".to_string()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Utf8(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}
