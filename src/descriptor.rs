//! Server type descriptors.
//!
//! A query's input and output rows are described by a self-describing
//! byte blob: a flat sequence of descriptor records, each carrying a tag,
//! a 16-byte id and a payload that may reference earlier records by
//! position. Parsing walks the blob top-down and resolves references into
//! a [`TypeDesc`] tree. Parsing is pure: the same blob always yields
//! structurally-equal trees, and the server-declared id is trusted as the
//! cache key.

use bytes::Bytes;
use uuid::Uuid;

use crate::buff::Reader;
use crate::errors::{Error, Result};

/// Wire tags for descriptor records.
mod tag {
    pub const SET: u8 = 0;
    pub const OBJECT: u8 = 1;
    pub const BASE_SCALAR: u8 = 2;
    pub const SCALAR: u8 = 3;
    pub const TUPLE: u8 = 4;
    pub const NAMED_TUPLE: u8 = 5;
    pub const ARRAY: u8 = 6;
    pub const ENUM: u8 = 7;
}

/// A resolved type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDesc {
    /// Server-declared descriptor id; the cache key and wire reference.
    pub id: Uuid,
    pub kind: DescKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescKind {
    Set { element: Box<TypeDesc> },
    Object { fields: Vec<ObjectField> },
    Scalar { base_id: Uuid },
    Tuple { elements: Vec<TypeDesc> },
    NamedTuple { fields: Vec<(String, TypeDesc)> },
    Array { element: Box<TypeDesc> },
    Enum { members: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectField {
    pub name: String,
    pub flags: FieldFlags,
    pub ty: TypeDesc,
}

/// Per-field flags on object shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(pub u8);

impl FieldFlags {
    pub const IMPLICIT: u8 = 0x01;
    pub const LINK_PROPERTY: u8 = 0x02;
    pub const OPTIONAL: u8 = 0x04;

    pub fn implicit(self) -> bool {
        self.0 & Self::IMPLICIT != 0
    }

    pub fn link_property(self) -> bool {
        self.0 & Self::LINK_PROPERTY != 0
    }

    pub fn optional(self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }
}

impl TypeDesc {
    /// The empty input row: a zero-field tuple with the nil id. Servers
    /// send a zero-length blob for queries that take no arguments.
    pub fn empty_tuple() -> TypeDesc {
        TypeDesc {
            id: Uuid::nil(),
            kind: DescKind::Tuple { elements: vec![] },
        }
    }

    /// Parse a descriptor blob. The root descriptor is the last record.
    pub fn parse(blob: Bytes) -> Result<TypeDesc> {
        if blob.is_empty() {
            return Ok(TypeDesc::empty_tuple());
        }

        let mut r = Reader::new(blob);
        let mut parsed: Vec<TypeDesc> = Vec::new();

        while !r.is_empty() {
            let tag = r.pop_u8()?;
            let id = r.pop_uuid()?;

            let kind = match tag {
                tag::SET => DescKind::Set {
                    element: Box::new(reference(&parsed, r.pop_u16()?)?),
                },
                tag::OBJECT => {
                    let nfields = r.pop_u16()? as usize;
                    let mut fields = Vec::with_capacity(nfields);
                    for _ in 0..nfields {
                        let flags = FieldFlags(r.pop_u8()?);
                        let name = r.pop_str()?;
                        let ty = reference(&parsed, r.pop_u16()?)?;
                        fields.push(ObjectField { name, flags, ty });
                    }
                    DescKind::Object { fields }
                }
                tag::BASE_SCALAR => DescKind::Scalar { base_id: id },
                tag::SCALAR => {
                    let base = reference(&parsed, r.pop_u16()?)?;
                    let base_id = match base.kind {
                        DescKind::Scalar { base_id } => base_id,
                        _ => {
                            return Err(Error::protocol(format!(
                                "scalar descriptor {} refers to a non-scalar base",
                                id
                            )))
                        }
                    };
                    DescKind::Scalar { base_id }
                }
                tag::TUPLE => {
                    let nelems = r.pop_u16()? as usize;
                    let mut elements = Vec::with_capacity(nelems);
                    for _ in 0..nelems {
                        elements.push(reference(&parsed, r.pop_u16()?)?);
                    }
                    DescKind::Tuple { elements }
                }
                tag::NAMED_TUPLE => {
                    let nfields = r.pop_u16()? as usize;
                    let mut fields = Vec::with_capacity(nfields);
                    for _ in 0..nfields {
                        let name = r.pop_str()?;
                        fields.push((name, reference(&parsed, r.pop_u16()?)?));
                    }
                    DescKind::NamedTuple { fields }
                }
                tag::ARRAY => {
                    let element = Box::new(reference(&parsed, r.pop_u16()?)?);
                    let ndims = r.pop_u16()? as usize;
                    for _ in 0..ndims {
                        r.discard(4)?;
                    }
                    DescKind::Array { element }
                }
                tag::ENUM => {
                    let nmembers = r.pop_u16()? as usize;
                    let mut members = Vec::with_capacity(nmembers);
                    for _ in 0..nmembers {
                        members.push(r.pop_str()?);
                    }
                    DescKind::Enum { members }
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unknown descriptor tag {:#04x}",
                        other
                    )))
                }
            };

            parsed.push(TypeDesc { id, kind });
        }

        Ok(parsed.pop().expect("at least one descriptor parsed"))
    }
}

fn reference(parsed: &[TypeDesc], pos: u16) -> Result<TypeDesc> {
    parsed.get(pos as usize).cloned().ok_or_else(|| {
        Error::protocol(format!(
            "descriptor references position {} but only {} are declared",
            pos,
            parsed.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buff::Writer;

    fn base_scalar(w: &mut Writer, id: Uuid) {
        w.push_u8(tag::BASE_SCALAR);
        w.push_uuid(id);
    }

    #[test]
    fn parses_base_scalar() {
        let int64 = Uuid::from_u128(0x105);
        let mut w = Writer::new();
        base_scalar(&mut w, int64);

        let desc = TypeDesc::parse(w.take()).unwrap();
        assert_eq!(desc.id, int64);
        assert_eq!(desc.kind, DescKind::Scalar { base_id: int64 });
    }

    #[test]
    fn parses_object_with_references() {
        let int64 = Uuid::from_u128(0x105);
        let str_id = Uuid::from_u128(0x101);
        let obj_id = Uuid::from_u128(0xABCD);

        let mut w = Writer::new();
        base_scalar(&mut w, int64);
        base_scalar(&mut w, str_id);
        w.push_u8(tag::OBJECT);
        w.push_uuid(obj_id);
        w.push_u16(2);
        w.push_u8(FieldFlags::IMPLICIT);
        w.push_str("id");
        w.push_u16(0);
        w.push_u8(0);
        w.push_str("name");
        w.push_u16(1);

        let desc = TypeDesc::parse(w.take()).unwrap();
        assert_eq!(desc.id, obj_id);
        match desc.kind {
            DescKind::Object { fields } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "id");
                assert!(fields[0].flags.implicit());
                assert_eq!(fields[1].name, "name");
                assert!(!fields[1].flags.implicit());
                assert_eq!(fields[1].ty.id, str_id);
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let int64 = Uuid::from_u128(0x105);
        let set_id = Uuid::from_u128(0xBEEF);
        let mut w = Writer::new();
        base_scalar(&mut w, int64);
        w.push_u8(tag::SET);
        w.push_uuid(set_id);
        w.push_u16(0);
        let blob = w.take();

        let a = TypeDesc::parse(blob.clone()).unwrap();
        let b = TypeDesc::parse(blob).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dangling_reference_is_protocol_error() {
        let mut w = Writer::new();
        w.push_u8(tag::SET);
        w.push_uuid(Uuid::from_u128(1));
        w.push_u16(3);
        let err = TypeDesc::parse(w.take()).unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::PROTOCOL));
    }

    #[test]
    fn empty_blob_is_the_empty_tuple() {
        let desc = TypeDesc::parse(Bytes::new()).unwrap();
        assert_eq!(desc.kind, DescKind::Tuple { elements: vec![] });
    }
}
