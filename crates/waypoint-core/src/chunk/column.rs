//! Typed columns with a null bitmap

use super::value::{DataType, Value};
use crate::error::{Error, Result};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Backing storage of a column
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    /// Integer values
    Int64(Vec<i64>),
    /// Float values
    Float64(Vec<f64>),
    /// Boolean values
    Bool(Vec<bool>),
    /// String values
    Utf8(Vec<String>),
}

impl ColumnData {
    fn empty(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            DataType::Float64 => ColumnData::Float64(Vec::with_capacity(capacity)),
            DataType::Bool => ColumnData::Bool(Vec::with_capacity(capacity)),
            DataType::Utf8 => ColumnData::Utf8(Vec::with_capacity(capacity)),
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
        }
    }
}

/// A column of one attribute: values plus a null bitmap (1 bit per element).
///
/// The bitmap is allocated lazily; an empty bitmap means "no nulls".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    data: ColumnData,
    null_mask: Vec<u8>,
}

impl Column {
    /// Create an empty column
    pub fn new(data_type: DataType) -> Self {
        Self::with_capacity(data_type, 0)
    }

    /// Create an empty column with room for `capacity` values
    pub fn with_capacity(data_type: DataType, capacity: usize) -> Self {
        Self {
            data: ColumnData::empty(data_type, capacity),
            null_mask: Vec::new(),
        }
    }

    /// Wrap existing data without nulls
    pub fn from_data(data: ColumnData) -> Self {
        Self {
            data,
            null_mask: Vec::new(),
        }
    }

    /// Column data type
    pub fn data_type(&self) -> DataType {
        match self.data {
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::Float64(_) => DataType::Float64,
            ColumnData::Bool(_) => DataType::Bool,
            ColumnData::Utf8(_) => DataType::Utf8,
        }
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the column holds no values
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw backing data
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Push a value; `Value::Null` appends a null
    pub fn push(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            self.push_null();
            return Ok(());
        }
        let data_type = self.data_type();
        match (&mut self.data, value) {
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(x),
            (ColumnData::Float64(v), Value::Float64(x)) => v.push(x),
            (ColumnData::Bool(v), Value::Bool(x)) => v.push(x),
            (ColumnData::Utf8(v), Value::Utf8(x)) => v.push(x),
            (_, other) => {
                return Err(Error::chunk(format!(
                    "type mismatch: column is {data_type}, value is {:?}",
                    other.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Push a typed value
    pub fn push_typed<T: ColumnValue>(&mut self, value: T) -> Result<()> {
        let dt = self.data_type();
        match T::vec_mut(&mut self.data) {
            Some(v) => {
                v.push(value);
                Ok(())
            }
            None => Err(Error::chunk(format!(
                "type mismatch: column is {dt}, value is {}",
                T::DATA_TYPE
            ))),
        }
    }

    /// Append a null: the bitmap bit is set and the payload is the type's zero
    pub fn push_null(&mut self) {
        let index = self.len();
        let zero = self.data_type().zero();
        // zero always matches the column type
        let _ = self.push(zero);
        let byte_index = index / 8;
        if self.null_mask.len() <= byte_index {
            self.null_mask.resize(byte_index + 1, 0);
        }
        self.null_mask[byte_index] |= 1 << (index % 8);
    }

    /// Check if value at index is null
    pub fn is_null(&self, index: usize) -> bool {
        if index >= self.len() {
            return true;
        }
        self.null_mask
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// True when at least one element is null
    pub fn has_nulls(&self) -> bool {
        self.null_mask.iter().any(|&b| b != 0)
    }

    /// Get a value; nulls come back as [`Value::Null`]
    pub fn value(&self, index: usize) -> Result<Value> {
        if index >= self.len() {
            return Err(Error::chunk(format!(
                "index {index} out of bounds for column of {}",
                self.len()
            )));
        }
        if self.is_null(index) {
            return Ok(Value::Null);
        }
        Ok(match &self.data {
            ColumnData::Int64(v) => Value::Int64(v[index]),
            ColumnData::Float64(v) => Value::Float64(v[index]),
            ColumnData::Bool(v) => Value::Bool(v[index]),
            ColumnData::Utf8(v) => Value::Utf8(v[index].clone()),
        })
    }

    /// Get a typed value; fails on nulls and type mismatches
    pub fn get<T: ColumnValue>(&self, index: usize) -> Result<T> {
        if self.is_null(index) {
            return Err(Error::chunk(format!("value at {index} is null or missing")));
        }
        let slice = self.as_slice::<T>()?;
        Ok(slice[index].clone())
    }

    /// Typed view of the payload (null positions hold zero payloads)
    pub fn as_slice<T: ColumnValue>(&self) -> Result<&[T]> {
        T::slice(&self.data).ok_or_else(|| {
            Error::chunk(format!(
                "type mismatch: column is {}, requested {}",
                self.data_type(),
                T::DATA_TYPE
            ))
        })
    }

    /// Append the encoding of the value at `index` to `buf`
    pub fn encode_value(&self, index: usize, buf: &mut impl BufMut) -> Result<()> {
        self.value(index)?.encode(buf);
        Ok(())
    }

    /// Gather the values at `indices`, in that order
    pub fn take(&self, indices: &[usize]) -> Result<Column> {
        let mut out = Column::with_capacity(self.data_type(), indices.len());
        for &i in indices {
            out.push(self.value(i)?)?;
        }
        Ok(out)
    }

    /// Filter by boolean mask
    pub fn filter_by_mask(&self, mask: &[bool]) -> Result<Column> {
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        self.take(&indices)
    }
}

impl From<Vec<i64>> for Column {
    fn from(v: Vec<i64>) -> Self {
        Column::from_data(ColumnData::Int64(v))
    }
}

impl From<Vec<f64>> for Column {
    fn from(v: Vec<f64>) -> Self {
        Column::from_data(ColumnData::Float64(v))
    }
}

impl From<Vec<bool>> for Column {
    fn from(v: Vec<bool>) -> Self {
        Column::from_data(ColumnData::Bool(v))
    }
}

impl From<Vec<String>> for Column {
    fn from(v: Vec<String>) -> Self {
        Column::from_data(ColumnData::Utf8(v))
    }
}

/// Trait for values that can be stored in columns
pub trait ColumnValue: Sized + Clone {
    /// Column type holding this value
    const DATA_TYPE: DataType;

    /// Typed view of matching column data
    fn slice(data: &ColumnData) -> Option<&[Self]>;

    /// Mutable typed storage of matching column data
    fn vec_mut(data: &mut ColumnData) -> Option<&mut Vec<Self>>;
}

macro_rules! column_value {
    ($ty:ty, $variant:ident) => {
        impl ColumnValue for $ty {
            const DATA_TYPE: DataType = DataType::$variant;

            fn slice(data: &ColumnData) -> Option<&[Self]> {
                match data {
                    ColumnData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn vec_mut(data: &mut ColumnData) -> Option<&mut Vec<Self>> {
                match data {
                    ColumnData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

column_value!(i64, Int64);
column_value!(f64, Float64);
column_value!(bool, Bool);
column_value!(String, Utf8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_push_get() {
        let mut column = Column::with_capacity(DataType::Int64, 10);

        column.push_typed(42i64).unwrap();
        column.push(Value::Int64(100)).unwrap();

        assert_eq!(column.get::<i64>(0).unwrap(), 42);
        assert_eq!(column.get::<i64>(1).unwrap(), 100);
        assert_eq!(column.len(), 2);
        assert!(column.push(Value::Bool(true)).is_err());
        assert!(column.get::<f64>(0).is_err());
    }

    #[test]
    fn test_null_contract() {
        let mut column = Column::new(DataType::Utf8);
        column.push(Value::from("a")).unwrap();
        column.push_null();
        column.push(Value::from("c")).unwrap();

        assert!(!column.is_null(0));
        assert!(column.is_null(1));
        assert!(column.has_nulls());
        assert_eq!(column.value(1).unwrap(), Value::Null);
        // payload under a null is the type's zero
        assert_eq!(column.as_slice::<String>().unwrap()[1], "");
        assert!(column.get::<String>(1).is_err());
    }

    #[test]
    fn test_filter_by_mask_keeps_nulls() {
        let mut column = Column::new(DataType::Int64);
        column.push(Value::Int64(25)).unwrap();
        column.push_null();
        column.push(Value::Int64(35)).unwrap();

        let filtered = column.filter_by_mask(&[false, true, true]).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.is_null(0));
        assert_eq!(filtered.get::<i64>(1).unwrap(), 35);
    }
}
