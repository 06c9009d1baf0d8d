//! Compact binary encoding of the value tree.
//!
//! Every node is a CBOR array `[tag, payload]` (`[tag]` for null) so the
//! stream is fully self-describing: plain CBOR cannot distinguish a signed
//! from an unsigned integer once the sign is non-negative, and the variant
//! must survive a round trip. Tags:
//!
//! ```text
//! 0 null   1 bool   2 int    3 uint   4 float(f32)   5 double(f64)
//! 6 string 7 bytes  8 ndarray [shape, [code,bits,lanes], data]
//! 9 array  10 map
//! ```

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::{Dtype, DtypeCode, NdArray, Value, ValueMap};

const TAG_NULL: u64 = 0;
const TAG_BOOL: u64 = 1;
const TAG_INT: u64 = 2;
const TAG_UINT: u64 = 3;
const TAG_FLOAT: u64 = 4;
const TAG_DOUBLE: u64 = 5;
const TAG_STR: u64 = 6;
const TAG_BYTES: u64 = 7;
const TAG_NDARRAY: u64 = 8;
const TAG_ARRAY: u64 = 9;
const TAG_MAP: u64 = 10;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("malformed value: {0}")]
    Cbor(String),
    #[error("malformed value: non-finite float has no canonical JSON form")]
    NonFiniteFloat,
}

impl From<minicbor::encode::Error<std::convert::Infallible>> for EncodeError {
    fn from(err: minicbor::encode::Error<std::convert::Infallible>) -> Self {
        EncodeError::Cbor(err.to_string())
    }
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("malformed value: truncated input")]
    Truncated,
    #[error("malformed value: {0} trailing bytes after root")]
    TrailingBytes(usize),
    #[error("malformed value: unknown variant tag {0}")]
    UnknownTag(u64),
    #[error("malformed value: node is not a [tag, payload] array")]
    BadNode,
    #[error("malformed value: indefinite-length item")]
    IndefiniteLength,
    #[error("malformed value: duplicate map key `{0}`")]
    DuplicateKey(String),
    #[error("malformed value: bad dtype")]
    BadDtype,
    #[error("malformed value: ndarray data is {got} bytes, shape implies {expected}")]
    NdArraySize { expected: usize, got: usize },
    #[error("malformed value: nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("malformed value: {0}")]
    Cbor(String),
}

impl From<minicbor::decode::Error> for DecodeError {
    fn from(err: minicbor::decode::Error) -> Self {
        if err.is_end_of_input() {
            DecodeError::Truncated
        } else {
            DecodeError::Cbor(err.to_string())
        }
    }
}

pub fn encode(value: &Value) -> Result<Bytes, EncodeError> {
    let mut encoder = Encoder::new(Vec::new());
    encode_node(&mut encoder, value)?;
    Ok(Bytes::from(encoder.into_writer()))
}

pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let mut decoder = Decoder::new(input);
    let value = decode_node(&mut decoder, 0)?;
    if decoder.position() != input.len() {
        return Err(DecodeError::TrailingBytes(input.len() - decoder.position()));
    }
    Ok(value)
}

fn encode_node(
    e: &mut Encoder<Vec<u8>>,
    value: &Value,
) -> Result<(), EncodeError> {
    match value {
        Value::Null => {
            e.array(1)?.u64(TAG_NULL)?;
        }
        Value::Bool(v) => {
            e.array(2)?.u64(TAG_BOOL)?.bool(*v)?;
        }
        Value::Int(v) => {
            e.array(2)?.u64(TAG_INT)?.i64(*v)?;
        }
        Value::Uint(v) => {
            e.array(2)?.u64(TAG_UINT)?.u64(*v)?;
        }
        Value::Float(v) => {
            e.array(2)?.u64(TAG_FLOAT)?.f32(*v)?;
        }
        Value::Double(v) => {
            e.array(2)?.u64(TAG_DOUBLE)?.f64(*v)?;
        }
        Value::Str(v) => {
            e.array(2)?.u64(TAG_STR)?.str(v)?;
        }
        Value::Bytes(v) => {
            e.array(2)?.u64(TAG_BYTES)?.bytes(v)?;
        }
        Value::NdArray(arr) => {
            e.array(2)?.u64(TAG_NDARRAY)?;
            e.array(3)?;
            e.array(arr.shape.len() as u64)?;
            for dim in &arr.shape {
                e.u64(*dim as u64)?;
            }
            e.array(3)?
                .u64(dtype_code_tag(arr.dtype.code))?
                .u64(arr.dtype.bits as u64)?
                .u64(arr.dtype.lanes as u64)?;
            e.bytes(&arr.data)?;
        }
        Value::Array(items) => {
            e.array(2)?.u64(TAG_ARRAY)?;
            e.array(items.len() as u64)?;
            for item in items {
                encode_node(e, item)?;
            }
        }
        Value::Map(map) => {
            e.array(2)?.u64(TAG_MAP)?;
            e.map(map.len() as u64)?;
            for (key, item) in map.iter() {
                e.str(key)?;
                encode_node(e, item)?;
            }
        }
    }
    Ok(())
}

fn decode_node(d: &mut Decoder<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    let len = d.array()?.ok_or(DecodeError::IndefiniteLength)?;
    let tag = d.u64()?;
    match (tag, len) {
        (TAG_NULL, 1) => Ok(Value::Null),
        (TAG_BOOL, 2) => Ok(Value::Bool(d.bool()?)),
        (TAG_INT, 2) => Ok(Value::Int(d.i64()?)),
        (TAG_UINT, 2) => Ok(Value::Uint(d.u64()?)),
        (TAG_FLOAT, 2) => Ok(Value::Float(d.f32()?)),
        (TAG_DOUBLE, 2) => Ok(Value::Double(d.f64()?)),
        (TAG_STR, 2) => Ok(Value::Str(d.str()?.to_string())),
        (TAG_BYTES, 2) => Ok(Value::Bytes(Bytes::copy_from_slice(d.bytes()?))),
        (TAG_NDARRAY, 2) => decode_ndarray(d),
        (TAG_ARRAY, 2) => {
            let count = d.array()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(decode_node(d, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        (TAG_MAP, 2) => {
            let count = d.map()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut map = ValueMap::new();
            for _ in 0..count {
                let key = d.str()?.to_string();
                if map.contains_key(&key) {
                    return Err(DecodeError::DuplicateKey(key));
                }
                let item = decode_node(d, depth + 1)?;
                map.insert(key, item);
            }
            Ok(Value::Map(map))
        }
        (tag, _) if tag > TAG_MAP => Err(DecodeError::UnknownTag(tag)),
        _ => Err(DecodeError::BadNode),
    }
}

fn decode_ndarray(d: &mut Decoder<'_>) -> Result<Value, DecodeError> {
    let parts = d.array()?.ok_or(DecodeError::IndefiniteLength)?;
    if parts != 3 {
        return Err(DecodeError::BadNode);
    }
    let dims = d.array()?.ok_or(DecodeError::IndefiniteLength)?;
    let mut shape = Vec::with_capacity(dims.min(64) as usize);
    for _ in 0..dims {
        shape.push(d.u64()? as usize);
    }
    let fields = d.array()?.ok_or(DecodeError::IndefiniteLength)?;
    if fields != 3 {
        return Err(DecodeError::BadDtype);
    }
    let code = parse_dtype_code(d.u64()?)?;
    let bits = d.u64()?;
    let lanes = d.u64()?;
    if !matches!(bits, 8 | 16 | 32 | 64) || lanes == 0 || lanes > u16::MAX as u64 {
        return Err(DecodeError::BadDtype);
    }
    let dtype = Dtype::new(code, bits as u8, lanes as u16);
    let data = Bytes::copy_from_slice(d.bytes()?);
    NdArray::new(shape, dtype, data)
        .map(Value::NdArray)
        .map_err(|err| DecodeError::NdArraySize {
            expected: err.expected,
            got: err.got,
        })
}

fn dtype_code_tag(code: DtypeCode) -> u64 {
    match code {
        DtypeCode::Int => 0,
        DtypeCode::Uint => 1,
        DtypeCode::Float => 2,
    }
}

fn parse_dtype_code(tag: u64) -> Result<DtypeCode, DecodeError> {
    match tag {
        0 => Ok(DtypeCode::Int),
        1 => Ok(DtypeCode::Uint),
        2 => Ok(DtypeCode::Float),
        _ => Err(DecodeError::BadDtype),
    }
}

impl Value {
    /// Encodes the tree to its compact binary form.
    pub fn encode_binary(&self) -> Result<Bytes, EncodeError> {
        encode(self)
    }

    /// Decodes a tree from its compact binary form. Rejects truncation,
    /// trailing bytes, and unknown tags.
    pub fn decode_binary(input: &[u8]) -> Result<Value, DecodeError> {
        decode(input)
    }
}
