//! Canonical JSON encoding of the value tree.
//!
//! Byte buffers and n-d arrays have no native JSON form and escape to
//! structured objects keyed `$bytes` / `$ndarray`, with base64url payloads.
//! JSON numbers are canonical: non-negative integers decode as `Uint`,
//! negative as `Int`, fractional as `Double` (an `f32` widens on encode).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use serde_json::json;

use super::binary::{DecodeError, EncodeError};
use super::{Dtype, DtypeCode, NdArray, Value, ValueMap};

const BYTES_KEY: &str = "$bytes";
const NDARRAY_KEY: &str = "$ndarray";

pub fn to_json(value: &Value) -> Result<serde_json::Value, EncodeError> {
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(v) => Ok(json!(v)),
        Value::Int(v) => Ok(json!(v)),
        Value::Uint(v) => Ok(json!(v)),
        Value::Float(v) => number(*v as f64),
        Value::Double(v) => number(*v),
        Value::Str(v) => Ok(json!(v)),
        Value::Bytes(v) => {
            let mut obj = serde_json::Map::with_capacity(1);
            obj.insert(
                BYTES_KEY.to_string(),
                serde_json::Value::String(URL_SAFE_NO_PAD.encode(v)),
            );
            Ok(serde_json::Value::Object(obj))
        }
        Value::NdArray(arr) => {
            let body = json!({
                "shape": arr.shape,
                "dtype": {
                    "code": arr.dtype.code.as_str(),
                    "bits": arr.dtype.bits,
                    "lanes": arr.dtype.lanes,
                },
                "data": URL_SAFE_NO_PAD.encode(&arr.data),
            });
            let mut obj = serde_json::Map::with_capacity(1);
            obj.insert(NDARRAY_KEY.to_string(), body);
            Ok(serde_json::Value::Object(obj))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Map(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map.iter() {
                out.insert(key.to_string(), to_json(item)?);
            }
            Ok(serde_json::Value::Object(out))
        }
    }
}

pub fn from_json(json: &serde_json::Value) -> Result<Value, DecodeError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(v) => Ok(Value::Bool(*v)),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Ok(Value::Uint(v))
            } else if let Some(v) = n.as_i64() {
                Ok(Value::Int(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Value::Double(v))
            } else {
                Err(DecodeError::Cbor("unrepresentable number".to_string()))
            }
        }
        serde_json::Value::String(v) => Ok(Value::Str(v.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item)?);
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(encoded) = obj.get(BYTES_KEY) {
                    return decode_bytes_escape(encoded);
                }
                if let Some(body) = obj.get(NDARRAY_KEY) {
                    return decode_ndarray_escape(body);
                }
            }
            let mut map = ValueMap::new();
            for (key, item) in obj {
                if map.contains_key(key) {
                    return Err(DecodeError::DuplicateKey(key.clone()));
                }
                map.insert(key.clone(), from_json(item)?);
            }
            Ok(Value::Map(map))
        }
    }
}

fn number(v: f64) -> Result<serde_json::Value, EncodeError> {
    serde_json::Number::from_f64(v)
        .map(serde_json::Value::Number)
        .ok_or(EncodeError::NonFiniteFloat)
}

fn decode_bytes_escape(encoded: &serde_json::Value) -> Result<Value, DecodeError> {
    let raw = encoded
        .as_str()
        .ok_or_else(|| DecodeError::Cbor("$bytes payload is not a string".to_string()))?;
    let data = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|err| DecodeError::Cbor(format!("$bytes payload: {err}")))?;
    Ok(Value::Bytes(Bytes::from(data)))
}

fn decode_ndarray_escape(body: &serde_json::Value) -> Result<Value, DecodeError> {
    let obj = body
        .as_object()
        .ok_or_else(|| DecodeError::Cbor("$ndarray payload is not an object".to_string()))?;
    let shape: Vec<usize> = obj
        .get("shape")
        .and_then(|s| s.as_array())
        .ok_or(DecodeError::BadNode)?
        .iter()
        .map(|d| d.as_u64().map(|v| v as usize).ok_or(DecodeError::BadNode))
        .collect::<Result<_, _>>()?;
    let dtype_obj = obj
        .get("dtype")
        .and_then(|d| d.as_object())
        .ok_or(DecodeError::BadDtype)?;
    let code = dtype_obj
        .get("code")
        .and_then(|c| c.as_str())
        .and_then(DtypeCode::parse)
        .ok_or(DecodeError::BadDtype)?;
    let bits = dtype_obj
        .get("bits")
        .and_then(|b| b.as_u64())
        .filter(|b| matches!(b, 8 | 16 | 32 | 64))
        .ok_or(DecodeError::BadDtype)?;
    let lanes = dtype_obj
        .get("lanes")
        .and_then(|l| l.as_u64())
        .filter(|&l| l > 0 && l <= u16::MAX as u64)
        .ok_or(DecodeError::BadDtype)?;
    let raw = obj
        .get("data")
        .and_then(|d| d.as_str())
        .ok_or(DecodeError::BadNode)?;
    let data = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|err| DecodeError::Cbor(format!("$ndarray payload: {err}")))?;
    NdArray::new(shape, Dtype::new(code, bits as u8, lanes as u16), Bytes::from(data))
        .map(Value::NdArray)
        .map_err(|err| DecodeError::NdArraySize {
            expected: err.expected,
            got: err.got,
        })
}

impl Value {
    /// Encodes the tree to its canonical JSON string.
    pub fn to_json_string(&self) -> Result<String, EncodeError> {
        let json = to_json(self)?;
        serde_json::to_string(&json).map_err(|err| EncodeError::Cbor(err.to_string()))
    }

    /// Decodes a tree from JSON text.
    pub fn from_json_str(input: &str) -> Result<Value, DecodeError> {
        let json: serde_json::Value =
            serde_json::from_str(input).map_err(|err| DecodeError::Cbor(err.to_string()))?;
        from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_values_round_trip() {
        let value = Value::Map(
            ValueMap::new()
                .with("n", Value::Null)
                .with("b", Value::Bool(false))
                .with("u", Value::Uint(9))
                .with("i", Value::Int(-9))
                .with("d", Value::Double(2.5))
                .with("s", Value::Str("héllo".into()))
                .with("arr", Value::Array(vec![Value::Uint(1), Value::Str("x".into())])),
        );
        let text = value.to_json_string().expect("encode");
        let back = Value::from_json_str(&text).expect("decode");
        assert_eq!(value, back);
    }

    #[test]
    fn map_order_survives_json() {
        let value = Value::Map(
            ValueMap::new()
                .with("zeta", Value::Uint(1))
                .with("alpha", Value::Uint(2)),
        );
        let text = value.to_json_string().expect("encode");
        assert!(text.find("zeta").expect("zeta") < text.find("alpha").expect("alpha"));
        assert_eq!(Value::from_json_str(&text).expect("decode"), value);
    }

    #[test]
    fn bytes_escape_to_base64url_object() {
        let value = Value::Bytes(Bytes::from_static(b"\xfb\xff\x00"));
        let text = value.to_json_string().expect("encode");
        assert!(text.contains("$bytes"));
        assert_eq!(Value::from_json_str(&text).expect("decode"), value);
    }

    #[test]
    fn ndarray_escapes_and_validates_geometry() {
        let value = Value::NdArray(NdArray::from_f32(vec![2], &[1.0, -1.0]).expect("geometry"));
        let text = value.to_json_string().expect("encode");
        assert!(text.contains("$ndarray"));
        assert_eq!(Value::from_json_str(&text).expect("decode"), value);

        let bad = r#"{"$ndarray":{"shape":[3],"dtype":{"code":"float","bits":32,"lanes":1},"data":""}}"#;
        assert!(matches!(
            Value::from_json_str(bad),
            Err(DecodeError::NdArraySize { .. })
        ));
    }

    #[test]
    fn nan_has_no_json_form() {
        let value = Value::Double(f64::NAN);
        assert!(matches!(
            value.to_json_string(),
            Err(EncodeError::NonFiniteFloat)
        ));
    }

    #[test]
    fn plain_object_is_not_an_escape() {
        let back = Value::from_json_str(r#"{"$bytes": 3, "other": 1}"#).expect("decode");
        assert!(back.as_map().is_some());
    }
}
