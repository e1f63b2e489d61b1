//! Container codecs: arrays, sets, tuples, named tuples, objects, enums.
//!
//! Tuple-like payloads: `u32 nelems`, then per element `u32 reserved |
//! i32 length | bytes` with length −1 marking a missing value. Array and
//! set payloads: `u32 ndims | u32 flags | u32 reserved`, a `(length,
//! lower bound)` pair per dimension, then `n` length-prefixed elements.

use crate::buff::{Reader, Writer};
use crate::errors::{Error, Result};
use crate::value::Value;

use super::{decode_missing, CodecContext, DecodePlan, EncodePlan};

pub fn decode(plan: &DecodePlan, r: &mut Reader, ctx: &CodecContext) -> Result<Value> {
    match plan {
        DecodePlan::Array(element) => decode_sequence(element, r, ctx).map(Value::Array),
        DecodePlan::Set(element) => decode_sequence(element, r, ctx).map(Value::Set),
        DecodePlan::Tuple(elements) => {
            let nelems = r.pop_u32()? as usize;
            if nelems != elements.len() {
                return Err(Error::protocol(format!(
                    "tuple payload has {} elements, descriptor declares {}",
                    nelems,
                    elements.len()
                )));
            }
            let mut out = Vec::with_capacity(nelems);
            for (i, plan) in elements.iter().enumerate() {
                r.discard(4)?; // reserved
                out.push(
                    decode_element(plan, r, ctx)
                        .map_err(|e| e.at_path(&format!("[{}]", i)))?,
                );
            }
            Ok(Value::Tuple(out))
        }
        DecodePlan::NamedTuple(fields) => {
            let nelems = r.pop_u32()? as usize;
            if nelems != fields.len() {
                return Err(Error::protocol(format!(
                    "named tuple payload has {} elements, descriptor declares {}",
                    nelems,
                    fields.len()
                )));
            }
            let mut out = Vec::with_capacity(nelems);
            for (name, plan) in fields {
                r.discard(4)?; // reserved
                let value = decode_element(plan, r, ctx)
                    .map_err(|e| e.at_path(&format!(".{}", name)))?;
                out.push((name.clone(), value));
            }
            Ok(Value::NamedTuple(out))
        }
        DecodePlan::Object(fields) => {
            let nelems = r.pop_u32()? as usize;
            if nelems != fields.len() {
                return Err(Error::protocol(format!(
                    "object payload has {} fields, descriptor declares {}",
                    nelems,
                    fields.len()
                )));
            }
            let mut out = Vec::with_capacity(nelems);
            for field in fields {
                r.discard(4)?; // reserved
                let len = r.pop_i32()?;
                let value = if len < 0 {
                    if field.optional {
                        Value::Missing
                    } else {
                        return Err(Error::missing_required(format!(
                            "missing value for required field {:?}",
                            field.name
                        )));
                    }
                } else {
                    let mut elem = r.slice(len as usize)?;
                    super::decode(&field.plan, &mut elem, ctx)
                        .map_err(|e| e.at_path(&format!(".{}", field.name)))?
                };
                if !field.skip {
                    out.push((field.name.clone(), value));
                }
            }
            Ok(Value::Object(out))
        }
        DecodePlan::Enum(members) => {
            let raw = r.take_rest();
            let member = String::from_utf8(raw.to_vec())
                .map_err(|e| Error::invalid_type(format!("invalid UTF-8 in enum: {}", e)))?;
            if !members.iter().any(|m| *m == member) {
                return Err(Error::protocol(format!(
                    "enum value {:?} is not a declared member",
                    member
                )));
            }
            Ok(Value::Enum(member))
        }
        _ => unreachable!("scalar plans are handled by the scalar codec"),
    }
}

fn decode_sequence(
    element: &DecodePlan,
    r: &mut Reader,
    ctx: &CodecContext,
) -> Result<Vec<Value>> {
    let ndims = r.pop_u32()? as usize;
    r.discard(8)?; // flags + reserved
    if ndims == 0 {
        return Ok(Vec::new());
    }
    if ndims != 1 {
        return Err(Error::protocol(format!(
            "sequence payload declares {} dimensions, only one is supported",
            ndims
        )));
    }
    let len = r.pop_i32()?;
    r.discard(4)?; // lower bound
    if len < 0 {
        return Err(Error::protocol("negative sequence length"));
    }

    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        out.push(
            decode_element(element, r, ctx).map_err(|e| e.at_path(&format!("[{}]", i)))?,
        );
    }
    Ok(out)
}

/// One length-prefixed element: `i32 length | bytes`, length −1 marking
/// a missing value. Callers discard the reserved word first where the
/// layout carries one.
fn decode_element(plan: &DecodePlan, r: &mut Reader, ctx: &CodecContext) -> Result<Value> {
    let len = r.pop_i32()?;
    if len < 0 {
        return decode_missing(plan);
    }
    let mut elem = r.slice(len as usize)?;
    super::decode(plan, &mut elem, ctx)
}

pub fn encode(plan: &EncodePlan, w: &mut Writer, value: &Value, ctx: &CodecContext) -> Result<()> {
    let mismatch = |want: &str| {
        Error::invalid_type(format!("expected {} value, got {}", want, value.kind_name()))
    };
    match plan {
        EncodePlan::Array(element) | EncodePlan::Set(element) => {
            let items = match value {
                Value::Array(items) | Value::Set(items) => items,
                _ => return Err(mismatch("sequence")),
            };
            if items.is_empty() {
                w.push_u32(0); // no dimensions
                w.push_u32(0);
                w.push_u32(0);
                return Ok(());
            }
            w.push_u32(1);
            w.push_u32(0);
            w.push_u32(0);
            w.push_i32(items.len() as i32);
            w.push_i32(1); // lower bound
            for (i, item) in items.iter().enumerate() {
                encode_element(element, w, item, ctx)
                    .map_err(|e| e.at_path(&format!("[{}]", i)))?;
            }
            Ok(())
        }
        EncodePlan::Tuple(elements) => {
            let items = match value {
                Value::Tuple(items) => items,
                _ => return Err(mismatch("tuple")),
            };
            if items.len() != elements.len() {
                return Err(Error::invalid_type(format!(
                    "tuple value has {} elements, descriptor wants {}",
                    items.len(),
                    elements.len()
                )));
            }
            w.push_u32(elements.len() as u32);
            for (i, (plan, item)) in elements.iter().zip(items).enumerate() {
                w.push_u32(0); // reserved
                encode_element(plan, w, item, ctx)
                    .map_err(|e| e.at_path(&format!("[{}]", i)))?;
            }
            Ok(())
        }
        EncodePlan::NamedTuple(fields) => {
            let pairs = match value {
                Value::NamedTuple(pairs) => pairs,
                _ => return Err(mismatch("named tuple")),
            };
            w.push_u32(fields.len() as u32);
            for (name, plan) in fields {
                let item = pairs
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        Error::invalid_type(format!("missing argument {:?}", name))
                    })?;
                w.push_u32(0); // reserved
                encode_element(plan, w, item, ctx)
                    .map_err(|e| e.at_path(&format!(".{}", name)))?;
            }
            Ok(())
        }
        EncodePlan::Enum(members) => {
            let member = match value {
                Value::Enum(m) | Value::Str(m) => m,
                _ => return Err(mismatch("enum")),
            };
            if !members.iter().any(|m| m == member) {
                return Err(Error::invalid_type(format!(
                    "{:?} is not a member of the enum",
                    member
                )));
            }
            w.push_raw(member.as_bytes());
            Ok(())
        }
        EncodePlan::Scalar(_) => unreachable!("scalar plans are handled by the scalar codec"),
    }
}

fn encode_element(
    plan: &EncodePlan,
    w: &mut Writer,
    value: &Value,
    ctx: &CodecContext,
) -> Result<()> {
    if value.is_missing() {
        w.push_i32(-1);
        return Ok(());
    }
    w.begin_bytes();
    super::encode(plan, w, value, ctx)?;
    w.end_bytes()
}
