//! Codec registry: compiling (descriptor, shape) pairs into decoder and
//! encoder plans.
//!
//! Compilation is pure and deterministic — a plan is a plain data tree,
//! so compiling the same pair twice yields structurally equal plans. The
//! interpreters in [`scalar`], [`numeric`] and [`container`] execute the
//! plans against wire payloads. Connections cache compiled plans keyed by
//! descriptor id (encoders) or (descriptor id, shape id) (decoders).

pub mod container;
pub mod numeric;
pub mod scalar;

use std::sync::Arc;

use uuid::Uuid;

use crate::buff::{Reader, Writer};
use crate::descriptor::{DescKind, TypeDesc};
use crate::errors::{Error, Result};
use crate::shape::{ScalarShape, Shape};
use crate::value::Value;

/// User-supplied codec for the decimal scalar. The driver moves the raw
/// wire payload (digits, weight, sign, dscale) to and from the
/// marshaller; the host representation is entirely the marshaller's.
pub trait DecimalMarshaller: Send + Sync {
    /// Descriptor id this marshaller binds to.
    fn type_id(&self) -> Uuid {
        scalar::ids::DECIMAL
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>>;

    fn unmarshal(&self, payload: &[u8]) -> Result<Value>;
}

/// Compilation and interpretation context.
#[derive(Clone, Default)]
pub struct CodecContext {
    pub decimal: Option<Arc<dyn DecimalMarshaller>>,
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("decimal", &self.decimal.is_some())
            .finish()
    }
}

/// Compiled decoder tree for one (descriptor, shape) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodePlan {
    Scalar(ScalarShape),
    Optional(Box<DecodePlan>),
    Array(Box<DecodePlan>),
    Set(Box<DecodePlan>),
    Tuple(Vec<DecodePlan>),
    NamedTuple(Vec<(String, DecodePlan)>),
    Object(Vec<FieldPlan>),
    Enum(Vec<String>),
    /// Raw UTF-8 payload; used for the JSON io-format where the wire
    /// value is surfaced verbatim regardless of the declared shape.
    JsonText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldPlan {
    pub name: String,
    pub optional: bool,
    /// Decode and drop: wire field with no host binding (implicit ones).
    pub skip: bool,
    pub plan: DecodePlan,
}

/// Compiled encoder tree for one input descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodePlan {
    Scalar(ScalarShape),
    Array(Box<EncodePlan>),
    Set(Box<EncodePlan>),
    Tuple(Vec<EncodePlan>),
    NamedTuple(Vec<(String, EncodePlan)>),
    Enum(Vec<String>),
}

// ============================================================================
// Decoder compilation
// ============================================================================

/// Compile a decoder plan binding `desc` to the caller's `shape`.
pub fn compile_decoder(
    desc: &TypeDesc,
    shape: &Shape,
    ctx: &CodecContext,
) -> Result<DecodePlan> {
    match shape {
        Shape::Optional(inner) => Ok(DecodePlan::Optional(Box::new(compile_decoder(
            desc, inner, ctx,
        )?))),
        Shape::Dynamic => compile_dynamic(desc, ctx),
        Shape::Scalar(kind) => {
            let base_id = match &desc.kind {
                DescKind::Scalar { base_id } => *base_id,
                other => {
                    return Err(Error::invalid_type(format!(
                        "shape wants scalar {:?} but the wire declares {}",
                        kind,
                        kind_name(other)
                    )))
                }
            };
            let declared = scalar::kind_for(base_id).ok_or_else(|| {
                Error::invalid_type(format!("unsupported scalar type id {}", base_id))
            })?;
            if declared != *kind {
                return Err(Error::invalid_type(format!(
                    "shape wants scalar {:?} but the wire declares {:?}",
                    kind, declared
                )));
            }
            require_decimal_marshaller(declared, ctx)?;
            Ok(DecodePlan::Scalar(declared))
        }
        Shape::List(element) => match &desc.kind {
            DescKind::Array { element: elem_desc } => Ok(DecodePlan::Array(Box::new(
                compile_decoder(elem_desc, element, ctx)?,
            ))),
            DescKind::Set { element: elem_desc } => Ok(DecodePlan::Set(Box::new(
                compile_decoder(elem_desc, element, ctx)?,
            ))),
            other => Err(Error::invalid_type(format!(
                "shape wants a sequence but the wire declares {}",
                kind_name(other)
            ))),
        },
        Shape::Tuple(shapes) => match &desc.kind {
            DescKind::Tuple { elements } => {
                if elements.len() != shapes.len() {
                    return Err(Error::invalid_type(format!(
                        "tuple shape has {} elements but the wire declares {}",
                        shapes.len(),
                        elements.len()
                    )));
                }
                let mut plans = Vec::with_capacity(elements.len());
                for (i, (elem, shape)) in elements.iter().zip(shapes).enumerate() {
                    plans.push(
                        compile_decoder(elem, shape, ctx)
                            .map_err(|e| e.at_path(&format!("[{}]", i)))?,
                    );
                }
                Ok(DecodePlan::Tuple(plans))
            }
            other => Err(Error::invalid_type(format!(
                "shape wants a tuple but the wire declares {}",
                kind_name(other)
            ))),
        },
        Shape::Record(host_fields) => match &desc.kind {
            DescKind::NamedTuple { fields } => {
                compile_named_tuple_record(fields, host_fields, ctx)
            }
            DescKind::Object { fields } => compile_object_record(fields, host_fields, ctx),
            other => Err(Error::invalid_type(format!(
                "shape wants a record but the wire declares {}",
                kind_name(other)
            ))),
        },
        Shape::EnumStr => match &desc.kind {
            DescKind::Enum { members } => Ok(DecodePlan::Enum(members.clone())),
            other => Err(Error::invalid_type(format!(
                "shape wants an enum but the wire declares {}",
                kind_name(other)
            ))),
        },
    }
}

fn compile_named_tuple_record(
    wire: &[(String, TypeDesc)],
    host: &[(String, Shape)],
    ctx: &CodecContext,
) -> Result<DecodePlan> {
    if wire.len() != host.len() {
        return Err(Error::invalid_type(format!(
            "record shape has {} fields but the wire declares {}",
            host.len(),
            wire.len()
        )));
    }
    let mut plans = Vec::with_capacity(wire.len());
    for ((wire_name, desc), (host_name, shape)) in wire.iter().zip(host) {
        if wire_name != host_name {
            return Err(Error::invalid_type(format!(
                "record field {:?} does not bind to wire field {:?}",
                host_name, wire_name
            )));
        }
        let plan = compile_decoder(desc, shape, ctx)
            .map_err(|e| e.at_path(&format!(".{}", wire_name)))?;
        plans.push((wire_name.clone(), plan));
    }
    Ok(DecodePlan::NamedTuple(plans))
}

fn compile_object_record(
    wire: &[crate::descriptor::ObjectField],
    host: &[(String, Shape)],
    ctx: &CodecContext,
) -> Result<DecodePlan> {
    let mut host_iter = host.iter().peekable();
    let mut plans = Vec::with_capacity(wire.len());

    for field in wire {
        let bound = match host_iter.peek() {
            Some((name, _)) if *name == field.name => host_iter.next(),
            _ => None,
        };
        match bound {
            Some((name, shape)) => {
                if field.flags.optional() && !matches!(shape, Shape::Optional(_)) {
                    return Err(Error::invalid_type(format!(
                        "optional field {:?} requires an optional output slot",
                        name
                    )));
                }
                let plan = compile_decoder(&field.ty, shape, ctx)
                    .map_err(|e| e.at_path(&format!(".{}", name)))?;
                plans.push(FieldPlan {
                    name: name.clone(),
                    optional: matches!(shape, Shape::Optional(_)),
                    skip: false,
                    plan,
                });
            }
            None if field.flags.implicit() => {
                // no host slot asked for it; decode to keep the wire
                // position and drop the value
                let plan = compile_dynamic(&field.ty, ctx)
                    .map_err(|e| e.at_path(&format!(".{}", field.name)))?;
                plans.push(FieldPlan {
                    name: field.name.clone(),
                    optional: true,
                    skip: true,
                    plan,
                });
            }
            None => {
                return Err(Error::invalid_type(format!(
                    "record shape has no binding for wire field {:?}",
                    field.name
                )));
            }
        }
    }

    if let Some((name, _)) = host_iter.next() {
        return Err(Error::invalid_type(format!(
            "record field {:?} does not exist on the wire",
            name
        )));
    }
    Ok(DecodePlan::Object(plans))
}

/// Compile the natural decoder for a descriptor with no shape constraint.
fn compile_dynamic(desc: &TypeDesc, ctx: &CodecContext) -> Result<DecodePlan> {
    match &desc.kind {
        DescKind::Scalar { base_id } => {
            let kind = scalar::kind_for(*base_id).ok_or_else(|| {
                Error::invalid_type(format!("unsupported scalar type id {}", base_id))
            })?;
            require_decimal_marshaller(kind, ctx)?;
            Ok(DecodePlan::Scalar(kind))
        }
        DescKind::Array { element } => Ok(DecodePlan::Array(Box::new(compile_dynamic(
            element, ctx,
        )?))),
        DescKind::Set { element } => {
            Ok(DecodePlan::Set(Box::new(compile_dynamic(element, ctx)?)))
        }
        DescKind::Tuple { elements } => {
            let mut plans = Vec::with_capacity(elements.len());
            for (i, elem) in elements.iter().enumerate() {
                plans.push(
                    compile_dynamic(elem, ctx).map_err(|e| e.at_path(&format!("[{}]", i)))?,
                );
            }
            Ok(DecodePlan::Tuple(plans))
        }
        DescKind::NamedTuple { fields } => {
            let mut plans = Vec::with_capacity(fields.len());
            for (name, elem) in fields {
                let plan =
                    compile_dynamic(elem, ctx).map_err(|e| e.at_path(&format!(".{}", name)))?;
                plans.push((name.clone(), plan));
            }
            Ok(DecodePlan::NamedTuple(plans))
        }
        DescKind::Object { fields } => {
            let mut plans = Vec::with_capacity(fields.len());
            for field in fields {
                let plan = compile_dynamic(&field.ty, ctx)
                    .map_err(|e| e.at_path(&format!(".{}", field.name)))?;
                plans.push(FieldPlan {
                    name: field.name.clone(),
                    optional: field.flags.optional(),
                    skip: false,
                    plan,
                });
            }
            Ok(DecodePlan::Object(plans))
        }
        DescKind::Enum { members } => Ok(DecodePlan::Enum(members.clone())),
    }
}

fn require_decimal_marshaller(kind: ScalarShape, ctx: &CodecContext) -> Result<()> {
    if kind == ScalarShape::Decimal && ctx.decimal.is_none() {
        return Err(Error::invalid_type(
            "decimal values require a registered decimal marshaller",
        ));
    }
    Ok(())
}

// ============================================================================
// Encoder compilation
// ============================================================================

/// Compile an encoder plan for an input descriptor.
pub fn compile_encoder(desc: &TypeDesc, ctx: &CodecContext) -> Result<EncodePlan> {
    match &desc.kind {
        DescKind::Scalar { base_id } => {
            let kind = scalar::kind_for(*base_id).ok_or_else(|| {
                Error::invalid_type(format!("unsupported scalar type id {}", base_id))
            })?;
            require_decimal_marshaller(kind, ctx)?;
            Ok(EncodePlan::Scalar(kind))
        }
        DescKind::Array { element } => Ok(EncodePlan::Array(Box::new(compile_encoder(
            element, ctx,
        )?))),
        DescKind::Set { element } => {
            Ok(EncodePlan::Set(Box::new(compile_encoder(element, ctx)?)))
        }
        DescKind::Tuple { elements } => {
            let mut plans = Vec::with_capacity(elements.len());
            for (i, elem) in elements.iter().enumerate() {
                plans.push(
                    compile_encoder(elem, ctx).map_err(|e| e.at_path(&format!("[{}]", i)))?,
                );
            }
            Ok(EncodePlan::Tuple(plans))
        }
        DescKind::NamedTuple { fields } => {
            let mut plans = Vec::with_capacity(fields.len());
            for (name, elem) in fields {
                let plan =
                    compile_encoder(elem, ctx).map_err(|e| e.at_path(&format!(".{}", name)))?;
                plans.push((name.clone(), plan));
            }
            Ok(EncodePlan::NamedTuple(plans))
        }
        DescKind::Enum { members } => Ok(EncodePlan::Enum(members.clone())),
        DescKind::Object { .. } => Err(Error::invalid_type(
            "objects cannot be used as query arguments",
        )),
    }
}

// ============================================================================
// Interpretation
// ============================================================================

/// Decode one wire payload according to `plan`.
pub fn decode(plan: &DecodePlan, r: &mut Reader, ctx: &CodecContext) -> Result<Value> {
    match plan {
        DecodePlan::Scalar(kind) => scalar::decode(*kind, r, ctx),
        DecodePlan::Optional(inner) => decode(inner, r, ctx),
        DecodePlan::JsonText => {
            let raw = r.take_rest();
            String::from_utf8(raw.to_vec())
                .map(Value::Json)
                .map_err(|e| Error::protocol(format!("invalid UTF-8 in JSON result: {}", e)))
        }
        DecodePlan::Array(_)
        | DecodePlan::Set(_)
        | DecodePlan::Tuple(_)
        | DecodePlan::NamedTuple(_)
        | DecodePlan::Object(_)
        | DecodePlan::Enum(_) => container::decode(plan, r, ctx),
    }
}

/// The value a plan produces for a missing wire payload.
pub fn decode_missing(plan: &DecodePlan) -> Result<Value> {
    match plan {
        DecodePlan::Optional(_) => Ok(Value::Missing),
        _ => Err(Error::missing_required("missing value for required slot")),
    }
}

/// Encode `value` into `w` according to `plan`.
pub fn encode(plan: &EncodePlan, w: &mut Writer, value: &Value, ctx: &CodecContext) -> Result<()> {
    match plan {
        EncodePlan::Scalar(kind) => scalar::encode(*kind, w, value, ctx),
        EncodePlan::Array(_)
        | EncodePlan::Set(_)
        | EncodePlan::Tuple(_)
        | EncodePlan::NamedTuple(_)
        | EncodePlan::Enum(_) => container::encode(plan, w, value, ctx),
    }
}

fn kind_name(kind: &DescKind) -> &'static str {
    match kind {
        DescKind::Set { .. } => "set",
        DescKind::Object { .. } => "object",
        DescKind::Scalar { .. } => "scalar",
        DescKind::Tuple { .. } => "tuple",
        DescKind::NamedTuple { .. } => "named tuple",
        DescKind::Array { .. } => "array",
        DescKind::Enum { .. } => "enum",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FieldFlags, ObjectField};

    fn int64_desc() -> TypeDesc {
        TypeDesc {
            id: scalar::ids::INT64,
            kind: DescKind::Scalar {
                base_id: scalar::ids::INT64,
            },
        }
    }

    fn str_desc() -> TypeDesc {
        TypeDesc {
            id: scalar::ids::STR,
            kind: DescKind::Scalar {
                base_id: scalar::ids::STR,
            },
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let desc = TypeDesc {
            id: Uuid::from_u128(0xAA),
            kind: DescKind::Object {
                fields: vec![
                    ObjectField {
                        name: "id".into(),
                        flags: FieldFlags(FieldFlags::IMPLICIT),
                        ty: TypeDesc {
                            id: scalar::ids::UUID,
                            kind: DescKind::Scalar {
                                base_id: scalar::ids::UUID,
                            },
                        },
                    },
                    ObjectField {
                        name: "name".into(),
                        flags: FieldFlags(0),
                        ty: str_desc(),
                    },
                ],
            },
        };
        let shape = Shape::record([("name", Shape::Scalar(ScalarShape::Str))]);
        let ctx = CodecContext::default();

        let a = compile_decoder(&desc, &shape, &ctx).unwrap();
        let b = compile_decoder(&desc, &shape, &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn scalar_shape_mismatch_is_invalid_type() {
        let ctx = CodecContext::default();
        let err =
            compile_decoder(&int64_desc(), &Shape::Scalar(ScalarShape::Str), &ctx).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::INVALID_TYPE));
    }

    #[test]
    fn optional_wire_field_requires_optional_slot() {
        let desc = TypeDesc {
            id: Uuid::from_u128(0xBB),
            kind: DescKind::Object {
                fields: vec![ObjectField {
                    name: "score".into(),
                    flags: FieldFlags(FieldFlags::OPTIONAL),
                    ty: int64_desc(),
                }],
            },
        };
        let ctx = CodecContext::default();

        let strict = Shape::record([("score", Shape::Scalar(ScalarShape::Int64))]);
        assert!(compile_decoder(&desc, &strict, &ctx).is_err());

        let relaxed = Shape::record([(
            "score",
            Shape::optional(Shape::Scalar(ScalarShape::Int64)),
        )]);
        assert!(compile_decoder(&desc, &relaxed, &ctx).is_ok());
    }

    #[test]
    fn unknown_record_field_is_an_error() {
        let desc = TypeDesc {
            id: Uuid::from_u128(0xCC),
            kind: DescKind::NamedTuple {
                fields: vec![("a".into(), int64_desc())],
            },
        };
        let ctx = CodecContext::default();
        let shape = Shape::record([("b", Shape::Scalar(ScalarShape::Int64))]);
        let err = compile_decoder(&desc, &shape, &ctx).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::INVALID_TYPE));
    }

    #[test]
    fn decimal_without_marshaller_fails_at_compile_time() {
        let desc = TypeDesc {
            id: scalar::ids::DECIMAL,
            kind: DescKind::Scalar {
                base_id: scalar::ids::DECIMAL,
            },
        };
        let ctx = CodecContext::default();
        let err = compile_decoder(&desc, &Shape::Dynamic, &ctx).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::INVALID_TYPE));
    }

    #[test]
    fn encoder_rejects_objects() {
        let desc = TypeDesc {
            id: Uuid::from_u128(0xDD),
            kind: DescKind::Object { fields: vec![] },
        };
        assert!(compile_encoder(&desc, &CodecContext::default()).is_err());
    }
}
