//! Tagged wire value used for every key, value and metadata field.
//!
//! A [`Variant`] is exactly one of `None`, `Int`, `Float` or `String`. String
//! payloads are raw bytes whose length is authoritative: embedded NUL bytes
//! survive a round trip and no terminator is assumed.
//!
//! Wire layout (little-endian), shared with PR1 field headers:
//!
//! ```text
//! u16 data_type | u32 data_size | payload[data_size]
//! ```

use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ClientError, Result};
use crate::protocol::data_type;

/// Size of the `data_type` + `data_size` prefix.
pub const VARIANT_HEADER_SIZE: usize = 6;

/// Tagged wire value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Variant {
    #[default]
    None,
    Int(i64),
    Float(f64),
    String(Bytes),
}

impl Variant {
    /// Build a string variant from anything byte-like.
    pub fn string(value: impl Into<Bytes>) -> Self {
        Variant::String(value.into())
    }

    /// Map a native value onto a variant.
    ///
    /// Signed (and narrow unsigned) integers become `Int`, floats become
    /// `Float`, text becomes `String`, `()` becomes `None`. Anything else is
    /// rejected rather than coerced.
    pub fn from_native<T: Any>(value: &T) -> Result<Self> {
        let any = value as &dyn Any;

        if any.is::<()>() {
            return Ok(Variant::None);
        }
        if let Some(v) = any.downcast_ref::<Variant>() {
            return Ok(v.clone());
        }
        if let Some(v) = any.downcast_ref::<i64>() {
            return Ok(Variant::Int(*v));
        }
        if let Some(v) = any.downcast_ref::<i32>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<i16>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<i8>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<isize>() {
            return Ok(Variant::Int(*v as i64));
        }
        if let Some(v) = any.downcast_ref::<u32>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<u16>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<u8>() {
            return Ok(Variant::Int(i64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<f64>() {
            return Ok(Variant::Float(*v));
        }
        if let Some(v) = any.downcast_ref::<f32>() {
            return Ok(Variant::Float(f64::from(*v)));
        }
        if let Some(v) = any.downcast_ref::<String>() {
            return Ok(Variant::string(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<&'static str>() {
            return Ok(Variant::string(*v));
        }

        Err(ClientError::UnsupportedType(
            std::any::type_name::<T>().to_string(),
        ))
    }

    /// Map a JSON value onto a variant.
    ///
    /// Numbers with a fractional part (or beyond `i64`) narrow to `Float`.
    /// Booleans, arrays and objects have no mapping.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Variant::None),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Variant::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Variant::Float(f))
                } else {
                    Err(ClientError::UnsupportedType(format!("number {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(Variant::string(s.clone())),
            serde_json::Value::Bool(_) => Err(ClientError::UnsupportedType("bool".to_string())),
            serde_json::Value::Array(_) => Err(ClientError::UnsupportedType("array".to_string())),
            serde_json::Value::Object(_) => {
                Err(ClientError::UnsupportedType("object".to_string()))
            }
        }
    }

    /// Convert back to a native JSON value. Non-UTF-8 strings are rendered lossily.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Variant::None => serde_json::Value::Null,
            Variant::Int(i) => serde_json::Value::from(*i),
            Variant::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Variant::String(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Wire type tag for this variant.
    pub fn data_type(&self) -> u16 {
        match self {
            Variant::None => data_type::NONE,
            Variant::String(_) => data_type::STRING,
            Variant::Int(_) => data_type::INT,
            Variant::Float(_) => data_type::DOUBLE,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Variant::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Variant::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Variant::String(b) => Some(b),
            _ => None,
        }
    }

    /// String payload, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Payload bytes as they travel on the wire (without the type/size prefix).
    pub fn payload(&self) -> Bytes {
        match self {
            Variant::None => Bytes::new(),
            Variant::String(b) => b.clone(),
            Variant::Int(i) => match i32::try_from(*i) {
                Ok(narrow) => Bytes::copy_from_slice(&narrow.to_le_bytes()),
                Err(_) => Bytes::copy_from_slice(&i.to_le_bytes()),
            },
            Variant::Float(f) => Bytes::copy_from_slice(&f.to_le_bytes()),
        }
    }

    /// Append the type tag, size and payload to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let payload = self.payload();
        buf.put_u16_le(self.data_type());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
    }

    /// Encode to standalone wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VARIANT_HEADER_SIZE + 8);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Rebuild a variant from its type tag and payload.
    pub fn from_payload(data_type: u16, payload: Bytes) -> Result<Self> {
        match data_type {
            data_type::NONE => Ok(Variant::None),
            data_type::STRING => Ok(Variant::String(payload)),
            data_type::INT => match payload.len() {
                4 => Ok(Variant::Int(i64::from((&payload[..]).get_i32_le()))),
                8 => Ok(Variant::Int((&payload[..]).get_i64_le())),
                n => Err(ClientError::protocol(format!("int field of {} bytes", n))),
            },
            data_type::DOUBLE => match payload.len() {
                8 => Ok(Variant::Float((&payload[..]).get_f64_le())),
                n => Err(ClientError::protocol(format!("double field of {} bytes", n))),
            },
            other => Err(ClientError::protocol(format!("unknown data type 0x{:x}", other))),
        }
    }

    /// Decode one variant from the front of `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < VARIANT_HEADER_SIZE {
            return Err(ClientError::protocol("truncated variant header"));
        }
        let data_type = buf.get_u16_le();
        let size = buf.get_u32_le() as usize;
        if buf.remaining() < size {
            return Err(ClientError::protocol(format!(
                "variant declares {} bytes, {} available",
                size,
                buf.remaining()
            )));
        }
        let payload = buf.split_to(size);
        Self::from_payload(data_type, payload)
    }
}

impl fmt::Display for Variant {
    /// `None` renders as the empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::None => Ok(()),
            Variant::Int(i) => write!(f, "{}", i),
            Variant::Float(v) => write!(f, "{}", v),
            Variant::String(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Variant {
            fn from(v: $t) -> Self {
                Variant::Int(i64::from(v))
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<f32> for Variant {
    fn from(v: f32) -> Self {
        Variant::Float(f64::from(v))
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(Bytes::from(v))
    }
}

impl From<&String> for Variant {
    fn from(v: &String) -> Self {
        Variant::from(v.as_str())
    }
}

impl From<()> for Variant {
    fn from(_: ()) -> Self {
        Variant::None
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Variant::None)
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Variant::from_json(&value).map_err(serde::de::Error::custom)
    }
}
