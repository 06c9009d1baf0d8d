//! The self-describing value tree used as every payload in the fabric.
//!
//! Module layout:
//! - this file: the `Value` sum, `ValueMap` (ordered string map), `NdArray`
//! - binary: compact CBOR encoding
//! - json: canonical JSON encoding with `$bytes`/`$ndarray` escapes

pub mod binary;
pub mod json;

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

pub use binary::{DecodeError, EncodeError};

/// Element type of an n-dimensional array: type class, bit width, lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dtype {
    pub code: DtypeCode,
    pub bits: u8,
    pub lanes: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtypeCode {
    Int,
    Uint,
    Float,
}

impl DtypeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtypeCode::Int => "int",
            DtypeCode::Uint => "uint",
            DtypeCode::Float => "float",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "int" => Some(DtypeCode::Int),
            "uint" => Some(DtypeCode::Uint),
            "float" => Some(DtypeCode::Float),
            _ => None,
        }
    }
}

impl Dtype {
    pub fn new(code: DtypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const F32: Dtype = Dtype {
        code: DtypeCode::Float,
        bits: 32,
        lanes: 1,
    };

    pub const I32: Dtype = Dtype {
        code: DtypeCode::Int,
        bits: 32,
        lanes: 1,
    };

    pub fn bytes_per_element(&self) -> usize {
        (self.bits as usize / 8) * self.lanes as usize
    }
}

/// Invalid n-d array geometry.
#[derive(Debug, Error, Clone)]
#[error("ndarray data is {got} bytes, shape implies {expected}")]
pub struct NdArraySizeError {
    pub expected: usize,
    pub got: usize,
}

/// N-dimensional array: shape, element dtype, raw little-endian buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub data: Bytes,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, dtype: Dtype, data: Bytes) -> Result<Self, NdArraySizeError> {
        let arr = Self { shape, dtype, data };
        arr.check_size()?;
        Ok(arr)
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn check_size(&self) -> Result<(), NdArraySizeError> {
        let expected = self.element_count() * self.dtype.bytes_per_element();
        if expected != self.data.len() {
            return Err(NdArraySizeError {
                expected,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    /// Convenience constructor for an f32 tensor from host values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, NdArraySizeError> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(shape, Dtype::F32, Bytes::from(data))
    }

    /// Reads the buffer back as f32 values (little-endian).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Ordered string→value map: insertion order preserved, keys unique.
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.index.get(key).map(|&i| &mut self.entries[i].1)
    }

    /// Inserts or replaces. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for idx in self.index.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Builder-style insert for literal construction.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(String, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Discriminant of a [`Value`], used in diagnostics and type errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Uint,
    Float,
    Double,
    Str,
    Bytes,
    NdArray,
    Array,
    Map,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Uint => "uint",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::Str => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::NdArray => "ndarray",
            ValueKind::Array => "array",
            ValueKind::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polymorphic payload tree. The sole payload carrier across every boundary
/// in the fabric; both wire encodings carry the variant tag.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(Bytes),
    NdArray(NdArray),
    Array(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::NdArray(_) => ValueKind::NdArray,
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed view over either integer variant, when it fits.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ndarray(&self) -> Option<&NdArray> {
        match self {
            Value::NdArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Map field lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Array element lookup; `None` for non-arrays and out of range.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.as_array().and_then(|a| a.get(index))
    }

    /// An empty map, the conventional "no output" body.
    pub fn empty_map() -> Value {
        Value::Map(ValueMap::new())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::NdArray(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}
