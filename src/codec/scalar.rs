//! Built-in scalar codecs.
//!
//! Each scalar payload arrives as an exact byte slice (the container
//! layer strips the length prefix); decoders validate the width and
//! produce the host value. The base-id table is fixed by the protocol.

use uuid::Uuid;

use crate::buff::{Reader, Writer};
use crate::datetime::{Duration, LocalDateTime};
use crate::errors::{Error, Result};
use crate::shape::ScalarShape;
use crate::value::Value;

use super::{numeric, CodecContext};

/// Well-known base scalar type ids.
pub mod ids {
    use uuid::Uuid;

    pub const UUID: Uuid = Uuid::from_u128(0x100);
    pub const STR: Uuid = Uuid::from_u128(0x101);
    pub const BYTES: Uuid = Uuid::from_u128(0x102);
    pub const INT16: Uuid = Uuid::from_u128(0x103);
    pub const INT32: Uuid = Uuid::from_u128(0x104);
    pub const INT64: Uuid = Uuid::from_u128(0x105);
    pub const FLOAT32: Uuid = Uuid::from_u128(0x106);
    pub const FLOAT64: Uuid = Uuid::from_u128(0x107);
    pub const DECIMAL: Uuid = Uuid::from_u128(0x108);
    pub const BOOL: Uuid = Uuid::from_u128(0x109);
    pub const DATETIME: Uuid = Uuid::from_u128(0x10A);
    pub const LOCAL_DATETIME: Uuid = Uuid::from_u128(0x10B);
    pub const DURATION: Uuid = Uuid::from_u128(0x10E);
    pub const JSON: Uuid = Uuid::from_u128(0x10F);
    pub const BIGINT: Uuid = Uuid::from_u128(0x110);
}

/// The fixed base-id → codec table.
const SCALAR_TABLE: [(Uuid, ScalarShape); 15] = [
    (ids::UUID, ScalarShape::Uuid),
    (ids::STR, ScalarShape::Str),
    (ids::BYTES, ScalarShape::Bytes),
    (ids::INT16, ScalarShape::Int16),
    (ids::INT32, ScalarShape::Int32),
    (ids::INT64, ScalarShape::Int64),
    (ids::FLOAT32, ScalarShape::Float32),
    (ids::FLOAT64, ScalarShape::Float64),
    (ids::DECIMAL, ScalarShape::Decimal),
    (ids::BOOL, ScalarShape::Bool),
    (ids::DATETIME, ScalarShape::DateTime),
    (ids::LOCAL_DATETIME, ScalarShape::LocalDateTime),
    (ids::DURATION, ScalarShape::Duration),
    (ids::JSON, ScalarShape::Json),
    (ids::BIGINT, ScalarShape::BigInt),
];

/// Map a base scalar id to its codec kind.
pub fn kind_for(base_id: Uuid) -> Option<ScalarShape> {
    SCALAR_TABLE
        .iter()
        .find(|(id, _)| *id == base_id)
        .map(|(_, kind)| *kind)
}

/// The base id a scalar kind encodes as.
pub fn id_for(kind: ScalarShape) -> Uuid {
    match kind {
        ScalarShape::Uuid => ids::UUID,
        ScalarShape::Str => ids::STR,
        ScalarShape::Bytes => ids::BYTES,
        ScalarShape::Int16 => ids::INT16,
        ScalarShape::Int32 => ids::INT32,
        ScalarShape::Int64 => ids::INT64,
        ScalarShape::Float32 => ids::FLOAT32,
        ScalarShape::Float64 => ids::FLOAT64,
        ScalarShape::Decimal => ids::DECIMAL,
        ScalarShape::Bool => ids::BOOL,
        ScalarShape::DateTime => ids::DATETIME,
        ScalarShape::LocalDateTime => ids::LOCAL_DATETIME,
        ScalarShape::Duration => ids::DURATION,
        ScalarShape::Json => ids::JSON,
        ScalarShape::BigInt => ids::BIGINT,
    }
}

fn expect_len(kind: ScalarShape, r: &Reader, want: usize) -> Result<()> {
    if r.remaining() != want {
        return Err(Error::invalid_type(format!(
            "{:?} payload must be {} bytes, got {}",
            kind,
            want,
            r.remaining()
        )));
    }
    Ok(())
}

/// Decode a scalar payload. `r` holds exactly the payload bytes.
pub fn decode(kind: ScalarShape, r: &mut Reader, ctx: &CodecContext) -> Result<Value> {
    match kind {
        ScalarShape::Bool => {
            expect_len(kind, r, 1)?;
            match r.pop_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(Error::invalid_type(format!("invalid bool byte {:#04x}", other))),
            }
        }
        ScalarShape::Int16 => {
            expect_len(kind, r, 2)?;
            Ok(Value::Int16(r.pop_u16()? as i16))
        }
        ScalarShape::Int32 => {
            expect_len(kind, r, 4)?;
            Ok(Value::Int32(r.pop_i32()?))
        }
        ScalarShape::Int64 => {
            expect_len(kind, r, 8)?;
            Ok(Value::Int64(r.pop_i64()?))
        }
        ScalarShape::Float32 => {
            expect_len(kind, r, 4)?;
            Ok(Value::Float32(f32::from_bits(r.pop_u32()?)))
        }
        ScalarShape::Float64 => {
            expect_len(kind, r, 8)?;
            Ok(Value::Float64(f64::from_bits(r.pop_u64()?)))
        }
        ScalarShape::Str => {
            let raw = r.take_rest();
            String::from_utf8(raw.to_vec())
                .map(Value::Str)
                .map_err(|e| Error::invalid_type(format!("invalid UTF-8 in str: {}", e)))
        }
        ScalarShape::Bytes => Ok(Value::Bytes(r.take_rest())),
        ScalarShape::Uuid => {
            expect_len(kind, r, 16)?;
            Ok(Value::Uuid(r.pop_uuid()?))
        }
        ScalarShape::Json => {
            let version = r.pop_u8()?;
            if version != 1 {
                return Err(Error::protocol(format!(
                    "unsupported JSON format version {}",
                    version
                )));
            }
            let raw = r.take_rest();
            String::from_utf8(raw.to_vec())
                .map(Value::Json)
                .map_err(|e| Error::invalid_type(format!("invalid UTF-8 in json: {}", e)))
        }
        ScalarShape::DateTime => {
            expect_len(kind, r, 8)?;
            Ok(Value::DateTime(r.pop_i64()?))
        }
        ScalarShape::LocalDateTime => {
            expect_len(kind, r, 8)?;
            Ok(Value::LocalDateTime(LocalDateTime::from_micros(r.pop_i64()?)))
        }
        ScalarShape::Duration => {
            expect_len(kind, r, 8)?;
            Ok(Value::Duration(Duration::from_micros(r.pop_i64()?)))
        }
        ScalarShape::BigInt => numeric::decode_bigint(r),
        ScalarShape::Decimal => {
            let marshaller = ctx
                .decimal
                .as_ref()
                .ok_or_else(|| Error::invalid_type("no decimal marshaller registered"))?;
            let raw = r.take_rest();
            marshaller.unmarshal(&raw)
        }
    }
}

/// Encode a scalar payload (no length prefix; the container layer wraps
/// it).
pub fn encode(kind: ScalarShape, w: &mut Writer, value: &Value, ctx: &CodecContext) -> Result<()> {
    let mismatch = || {
        Error::invalid_type(format!(
            "expected {:?} value, got {}",
            kind,
            value.kind_name()
        ))
    };
    match (kind, value) {
        (ScalarShape::Bool, Value::Bool(v)) => w.push_u8(*v as u8),
        (ScalarShape::Int16, Value::Int16(v)) => w.push_u16(*v as u16),
        (ScalarShape::Int32, Value::Int32(v)) => w.push_i32(*v),
        (ScalarShape::Int64, Value::Int64(v)) => w.push_i64(*v),
        (ScalarShape::Float32, Value::Float32(v)) => w.push_u32(v.to_bits()),
        (ScalarShape::Float64, Value::Float64(v)) => w.push_u64(v.to_bits()),
        (ScalarShape::Str, Value::Str(v)) => w.push_raw(v.as_bytes()),
        (ScalarShape::Bytes, Value::Bytes(v)) => w.push_raw(v),
        (ScalarShape::Uuid, Value::Uuid(v)) => w.push_uuid(*v),
        (ScalarShape::Json, Value::Json(v)) | (ScalarShape::Json, Value::Str(v)) => {
            w.push_u8(1);
            w.push_raw(v.as_bytes());
        }
        (ScalarShape::DateTime, Value::DateTime(v)) => w.push_i64(*v),
        (ScalarShape::LocalDateTime, Value::LocalDateTime(v)) => w.push_i64(v.micros()),
        (ScalarShape::Duration, Value::Duration(v)) => w.push_i64(v.micros()),
        (ScalarShape::BigInt, Value::BigInt(v)) => numeric::encode_bigint(w, v),
        (ScalarShape::Decimal, _) => {
            let marshaller = ctx
                .decimal
                .as_ref()
                .ok_or_else(|| Error::invalid_type("no decimal marshaller registered"))?;
            let raw = marshaller.marshal(value)?;
            w.push_raw(&raw);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn roundtrip(kind: ScalarShape, value: Value) {
        let ctx = CodecContext::default();
        let mut w = Writer::new();
        encode(kind, &mut w, &value, &ctx).unwrap();
        let mut r = Reader::new(w.take());
        let back = decode(kind, &mut r, &ctx).unwrap();
        assert_eq!(back, value);
        assert!(r.is_empty());
    }

    #[test]
    fn fixed_width_scalars_roundtrip() {
        roundtrip(ScalarShape::Bool, Value::Bool(true));
        roundtrip(ScalarShape::Int16, Value::Int16(-513));
        roundtrip(ScalarShape::Int32, Value::Int32(i32::MIN));
        roundtrip(ScalarShape::Int64, Value::Int64(1));
        roundtrip(ScalarShape::Float32, Value::Float32(1.25));
        roundtrip(ScalarShape::Float64, Value::Float64(-0.0));
        roundtrip(ScalarShape::Uuid, Value::Uuid(Uuid::from_u128(0xFEED)));
        roundtrip(ScalarShape::DateTime, Value::DateTime(-62));
        roundtrip(ScalarShape::Duration, Value::Duration(Duration(90_000_000)));
    }

    #[test]
    fn variable_width_scalars_roundtrip() {
        roundtrip(ScalarShape::Str, Value::Str("héllo wörld".into()));
        roundtrip(
            ScalarShape::Bytes,
            Value::Bytes(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF])),
        );
        roundtrip(ScalarShape::Json, Value::Json("{\"a\": 1}".into()));
    }

    #[test]
    fn bool_payload_validated() {
        let ctx = CodecContext::default();
        let mut r = Reader::new(Bytes::from_static(&[2]));
        assert!(decode(ScalarShape::Bool, &mut r, &ctx).is_err());
        let mut r = Reader::new(Bytes::from_static(&[1, 0]));
        assert!(decode(ScalarShape::Bool, &mut r, &ctx).is_err());
    }

    #[test]
    fn int64_wrong_width_is_invalid_type() {
        let ctx = CodecContext::default();
        let mut r = Reader::new(Bytes::from_static(&[0, 0, 0, 1]));
        let err = decode(ScalarShape::Int64, &mut r, &ctx).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::INVALID_TYPE));
    }

    #[test]
    fn value_kind_mismatch_is_invalid_type() {
        let ctx = CodecContext::default();
        let mut w = Writer::new();
        let err = encode(ScalarShape::Int64, &mut w, &Value::Str("1".into()), &ctx).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::INVALID_TYPE));
    }

    #[test]
    fn json_version_byte_checked() {
        let ctx = CodecContext::default();
        let mut r = Reader::new(Bytes::from_static(b"\x02{}"));
        assert!(decode(ScalarShape::Json, &mut r, &ctx).is_err());
    }

    #[test]
    fn base_id_table_is_consistent() {
        for kind in [
            ScalarShape::Bool,
            ScalarShape::Int16,
            ScalarShape::Int32,
            ScalarShape::Int64,
            ScalarShape::Float32,
            ScalarShape::Float64,
            ScalarShape::Str,
            ScalarShape::Bytes,
            ScalarShape::Uuid,
            ScalarShape::Json,
            ScalarShape::DateTime,
            ScalarShape::LocalDateTime,
            ScalarShape::Duration,
            ScalarShape::BigInt,
            ScalarShape::Decimal,
        ] {
            assert_eq!(kind_for(id_for(kind)), Some(kind));
        }
    }
}
