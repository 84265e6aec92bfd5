//! Value - the closed set of things a pack variable can hold.
//!
//! # Supported Types
//!
//! - **Null**: absence of a value
//! - **Bool**, **Int** (i64), **Float** (f64): scalars
//! - **Text**: UTF-8 string
//! - **Sequence**: ordered list of values
//! - **Mapping**: string-keyed map of values (ordered by key)
//! - **Array**: owned numeric n-d array
//! - **Placeholder**: stand-in for an array spilled to its own file; only
//!   exists inside mappings while a save or load is in progress
//! - **Mapped**: numeric array backed by a memory-mapped file
//!
//! # Example
//!
//! ```rust
//! use varpack::Value;
//! use std::collections::BTreeMap;
//!
//! let scalar = Value::from(10);
//! let text = Value::from("test");
//! let list = Value::from(vec![Value::from(1), Value::from(2)]);
//!
//! let mut map = BTreeMap::new();
//! map.insert("weights".to_string(), Value::from(ndarray::Array1::<f64>::zeros(4)));
//! let map = Value::Mapping(map);
//! assert!(map.as_mapping().is_some());
//! # let _ = (scalar, text, list);
//! ```

use crate::array::mapped::MappedArray;
use crate::array::{ArrayData, DType, Element};
use crate::error::Result;
use crate::placeholder::ArrayPlaceholder;
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pack variable
///
/// `Mapped` is never serialized; the object codec materializes mapped arrays
/// into `Array` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    Array(ArrayData),
    Placeholder(ArrayPlaceholder),
    // Must stay last: binary formats number variants by position and a
    // skipped variant in the middle would shift the ones after it.
    #[serde(skip)]
    Mapped(MappedArray),
}

impl Value {
    /// Short type name for log output
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Array(_) => "array",
            Value::Mapped(_) => "mapped array",
            Value::Placeholder(_) => "placeholder",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for owned and memory-mapped arrays
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Mapped(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapped(&self) -> Option<&MappedArray> {
        match self {
            Value::Mapped(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_mapped_mut(&mut self) -> Option<&mut MappedArray> {
        match self {
            Value::Mapped(m) => Some(m),
            _ => None,
        }
    }

    /// Element count of an owned or mapped array
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(a.len()),
            Value::Mapped(m) => Some(m.len()),
            _ => None,
        }
    }

    pub fn array_dtype(&self) -> Option<DType> {
        match self {
            Value::Array(a) => Some(a.dtype()),
            Value::Mapped(m) => Some(m.dtype()),
            _ => None,
        }
    }

    /// Owned copy of the array data, reading through the mapping if needed
    pub fn to_array(&self) -> Result<Option<ArrayData>> {
        match self {
            Value::Array(a) => Ok(Some(a.clone())),
            Value::Mapped(m) => m.materialize().map(Some),
            _ => Ok(None),
        }
    }

    /// Deep copy with every memory-mapped array turned into an owned array
    pub fn materialized(&self) -> Result<Value> {
        Ok(match self {
            Value::Mapped(m) => Value::Array(m.materialize()?),
            Value::Sequence(items) => Value::Sequence(
                items
                    .iter()
                    .map(Value::materialized)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.materialized()?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Whether a memory-mapped array appears anywhere in this value
    pub fn contains_mapped(&self) -> bool {
        match self {
            Value::Mapped(_) => true,
            Value::Sequence(items) => items.iter().any(Value::contains_mapped),
            Value::Mapping(map) => map.values().any(Value::contains_mapped),
            _ => false,
        }
    }

    /// Whether an unresolved placeholder appears anywhere in this value
    pub fn contains_placeholders(&self) -> bool {
        match self {
            Value::Placeholder(_) => true,
            Value::Sequence(items) => items.iter().any(Value::contains_placeholders),
            Value::Mapping(map) => map.values().any(Value::contains_placeholders),
            _ => false,
        }
    }

    /// Flush every read-write mapping reachable from this value
    pub fn flush_mapped(&self) -> Result<()> {
        match self {
            Value::Mapped(m) => m.flush(),
            Value::Sequence(items) => items.iter().try_for_each(Value::flush_mapped),
            Value::Mapping(map) => map.values().try_for_each(Value::flush_mapped),
            _ => Ok(()),
        }
    }
}

impl PartialEq for Value {
    /// Arrays compare element-wise; a mapped array equals an owned array with
    /// the same contents.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Placeholder(a), Value::Placeholder(b)) => a == b,
            (Value::Mapped(_), _) | (_, Value::Mapped(_)) => {
                match (self.to_array(), other.to_array()) {
                    (Ok(Some(a)), Ok(Some(b))) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

// Conversions
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Mapping(map)
    }
}

impl From<ArrayData> for Value {
    fn from(data: ArrayData) -> Self {
        Value::Array(data)
    }
}

impl<T: Element, D: Dimension> From<Array<T, D>> for Value {
    fn from(array: Array<T, D>) -> Self {
        Value::Array(ArrayData::from(array))
    }
}

impl From<MappedArray> for Value {
    fn from(mapped: MappedArray) -> Self {
        Value::Mapped(mapped)
    }
}
