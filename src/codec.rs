// codec.rs - CBOR wire codec for protocol messages
//
// Every protocol message is a self-describing CBOR map keyed by short
// strings. This module owns the map-level encode/decode layer; message
// schemas live in protocol/. Decode failures are always Error::Format and
// name the offending field.

use crate::{Error, Result};
use ciborium::value::Value;

/// A protocol model that can cross the wire as a CBOR map.
pub trait WireMessage: Sized {
    /// Builds the CBOR value for this message.
    fn to_wire(&self) -> Value;

    /// Reconstructs the message, failing with `Error::Format` on any
    /// type mismatch or missing required field.
    fn from_wire(value: &Value) -> Result<Self>;
}

/// Encodes a message into CBOR bytes.
pub fn encode_to_vec<M: WireMessage>(msg: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&msg.to_wire(), &mut buf)
        .map_err(|e| Error::Format(format!("CBOR encode failed: {}", e)))?;
    Ok(buf)
}

/// Decodes a message from CBOR bytes.
///
/// Truncated or malformed input fails deterministically with
/// `Error::Format`.
pub fn decode_from_slice<M: WireMessage>(bytes: &[u8]) -> Result<M> {
    let value: Value = ciborium::de::from_reader(bytes)
        .map_err(|e| Error::Format(format!("CBOR decode failed: {}", e)))?;
    M::from_wire(&value)
}

/// Builder for string-keyed CBOR maps.
///
/// Absent optionals are omitted entirely rather than encoded as null, so a
/// round-trip reproduces the original byte layout.
pub struct MapEncoder {
    entries: Vec<(Value, Value)>,
}

impl MapEncoder {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, key: &str, value: Value) -> &mut Self {
        self.entries.push((Value::Text(key.to_string()), value));
        self
    }

    pub fn u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.push(key, Value::Integer(value.into()))
    }

    pub fn i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.push(key, Value::Integer(value.into()))
    }

    pub fn u32(&mut self, key: &str, value: u32) -> &mut Self {
        self.push(key, Value::Integer(value.into()))
    }

    pub fn bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.push(key, Value::Bool(value))
    }

    pub fn str(&mut self, key: &str, value: &str) -> &mut Self {
        self.push(key, Value::Text(value.to_string()))
    }

    pub fn opt_str(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.push(key, Value::Text(v.to_string()));
        }
        self
    }

    pub fn bytes(&mut self, key: &str, value: &[u8]) -> &mut Self {
        self.push(key, Value::Bytes(value.to_vec()))
    }

    pub fn opt_bytes(&mut self, key: &str, value: Option<&[u8]>) -> &mut Self {
        if let Some(v) = value {
            self.push(key, Value::Bytes(v.to_vec()));
        }
        self
    }

    pub fn array(&mut self, key: &str, items: Vec<Value>) -> &mut Self {
        self.push(key, Value::Array(items))
    }

    pub fn opt_array(&mut self, key: &str, items: Option<Vec<Value>>) -> &mut Self {
        if let Some(v) = items {
            self.push(key, Value::Array(v));
        }
        self
    }

    pub fn value(&mut self, key: &str, value: Value) -> &mut Self {
        self.push(key, value)
    }

    pub fn opt_value(&mut self, key: &str, value: Option<Value>) -> &mut Self {
        if let Some(v) = value {
            self.push(key, v);
        }
        self
    }

    pub fn finish(&mut self) -> Value {
        Value::Map(std::mem::take(&mut self.entries))
    }
}

impl Default for MapEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed reader over a string-keyed CBOR map.
pub struct MapDecoder<'a> {
    entries: &'a [(Value, Value)],
    context: &'static str,
}

impl<'a> MapDecoder<'a> {
    /// Wraps a decoded value, failing unless it is a map with string keys.
    pub fn new(value: &'a Value, context: &'static str) -> Result<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            other => {
                return Err(Error::Format(format!(
                    "{}: expected map, found {}",
                    context,
                    type_name(other)
                )))
            }
        };
        for (key, _) in entries {
            if !matches!(key, Value::Text(_)) {
                return Err(Error::Format(format!(
                    "{}: map key must be a string, found {}",
                    context,
                    type_name(key)
                )));
            }
        }
        Ok(Self { entries, context })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.entries.iter().find_map(|(k, v)| match k {
            Value::Text(t) if t == key => Some(v),
            _ => None,
        })
    }

    fn required(&self, key: &str) -> Result<&'a Value> {
        self.get(key).ok_or_else(|| {
            Error::Format(format!("{}: missing required field '{}'", self.context, key))
        })
    }

    fn mismatch(&self, key: &str, expected: &str, found: &Value) -> Error {
        Error::Format(format!(
            "{}: field '{}' expected {}, found {}",
            self.context,
            key,
            expected,
            type_name(found)
        ))
    }

    pub fn u64(&self, key: &str) -> Result<u64> {
        match self.required(key)? {
            Value::Integer(i) => u64::try_from(i128::from(*i))
                .map_err(|_| Error::Format(format!(
                    "{}: field '{}' out of u64 range",
                    self.context, key
                ))),
            other => Err(self.mismatch(key, "unsigned integer", other)),
        }
    }

    pub fn opt_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.u64(key).map(Some),
        }
    }

    pub fn u32(&self, key: &str) -> Result<u32> {
        let v = self.u64(key)?;
        u32::try_from(v).map_err(|_| {
            Error::Format(format!("{}: field '{}' out of u32 range", self.context, key))
        })
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        match self.required(key)? {
            Value::Integer(i) => i64::try_from(i128::from(*i))
                .map_err(|_| Error::Format(format!(
                    "{}: field '{}' out of i64 range",
                    self.context, key
                ))),
            other => Err(self.mismatch(key, "integer", other)),
        }
    }

    pub fn opt_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.i64(key).map(Some),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        match self.required(key)? {
            Value::Bool(b) => Ok(*b),
            other => Err(self.mismatch(key, "bool", other)),
        }
    }

    pub fn str(&self, key: &str) -> Result<&'a str> {
        match self.required(key)? {
            Value::Text(s) => Ok(s),
            other => Err(self.mismatch(key, "string", other)),
        }
    }

    pub fn string(&self, key: &str) -> Result<String> {
        self.str(key).map(str::to_string)
    }

    pub fn opt_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.mismatch(key, "string", other)),
        }
    }

    pub fn bytes(&self, key: &str) -> Result<Vec<u8>> {
        match self.required(key)? {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(self.mismatch(key, "byte string", other)),
        }
    }

    pub fn opt_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.clone())),
            Some(other) => Err(self.mismatch(key, "byte string", other)),
        }
    }

    pub fn array(&self, key: &str) -> Result<&'a [Value]> {
        match self.required(key)? {
            Value::Array(items) => Ok(items),
            other => Err(self.mismatch(key, "array", other)),
        }
    }

    pub fn opt_array(&self, key: &str) -> Result<Option<&'a [Value]>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(other) => Err(self.mismatch(key, "array", other)),
        }
    }

    pub fn value(&self, key: &str) -> Result<&'a Value> {
        self.required(key)
    }

    pub fn opt_value(&self, key: &str) -> Option<&'a Value> {
        match self.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "byte string",
        Value::Float(_) => "float",
        Value::Text(_) => "string",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(..) => "tag",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        count: u64,
        label: String,
        payload: Option<Vec<u8>>,
        active: bool,
    }

    impl WireMessage for Sample {
        fn to_wire(&self) -> Value {
            MapEncoder::new()
                .u64("count", self.count)
                .str("label", &self.label)
                .opt_bytes("payload", self.payload.as_deref())
                .bool("active", self.active)
                .finish()
        }

        fn from_wire(value: &Value) -> Result<Self> {
            let map = MapDecoder::new(value, "Sample")?;
            Ok(Self {
                count: map.u64("count")?,
                label: map.string("label")?,
                payload: map.opt_bytes("payload")?,
                active: map.bool("active")?,
            })
        }
    }

    #[test]
    fn round_trip_preserves_bytes_verbatim() {
        let sample = Sample {
            count: u64::MAX,
            label: "notes".to_string(),
            payload: Some(vec![0x00, 0xA0, 0xFF]),
            active: true,
        };
        let bytes = encode_to_vec(&sample).unwrap();
        let decoded: Sample = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn absent_optional_round_trips_as_none() {
        let sample = Sample {
            count: 1,
            label: String::new(),
            payload: None,
            active: false,
        };
        let bytes = encode_to_vec(&sample).unwrap();
        let decoded: Sample = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn truncated_input_is_format_error() {
        let sample = Sample {
            count: 7,
            label: "x".to_string(),
            payload: Some(vec![1, 2, 3]),
            active: true,
        };
        let bytes = encode_to_vec(&sample).unwrap();
        let result: Result<Sample> = decode_from_slice(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn type_mismatch_is_format_error() {
        let wire = MapEncoder::new().str("count", "not a number").finish();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&wire, &mut buf).unwrap();
        let result: Result<Sample> = decode_from_slice(&buf);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn non_string_map_key_is_rejected() {
        let wire = Value::Map(vec![(Value::Integer(1.into()), Value::Bool(true))]);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&wire, &mut buf).unwrap();
        let result: Result<Sample> = decode_from_slice(&buf);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let wire = MapEncoder::new().u64("count", 3).finish();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&wire, &mut buf).unwrap();
        let err = decode_from_slice::<Sample>(&buf).unwrap_err();
        assert!(err.to_string().contains("label"));
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_values_round_trip(
            count in proptest::prelude::any::<u64>(),
            label in ".*",
            payload in proptest::option::of(proptest::collection::vec(
                proptest::prelude::any::<u8>(),
                0..64,
            )),
            active in proptest::prelude::any::<bool>(),
        ) {
            let sample = Sample { count, label, payload, active };
            let bytes = encode_to_vec(&sample).unwrap();
            let decoded: Sample = decode_from_slice(&bytes).unwrap();
            proptest::prop_assert_eq!(decoded, sample);
        }
    }
}
