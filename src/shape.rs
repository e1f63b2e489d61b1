//! Output shape descriptors.
//!
//! A [`Shape`] tells the codec compiler what the caller wants a query
//! result (or argument) to look like on the host side: which scalar kind
//! fills each slot, which slots admit an absent state, how record fields
//! bind to wire names. Shapes are plain runtime values; their
//! [`ShapeId`] fingerprint is stable across processes and participates in
//! the decoder cache key.

/// Scalar slot kinds supported by the built-in codec table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarShape {
    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Bytes,
    Uuid,
    Json,
    DateTime,
    LocalDateTime,
    Duration,
    BigInt,
    /// Host representation supplied by a registered decimal marshaller.
    Decimal,
}

/// Description of the host-side slot a decoder writes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar(ScalarShape),
    /// Slot that admits a declared absent state.
    Optional(Box<Shape>),
    /// Ordered sequence; binds to arrays and sets.
    List(Box<Shape>),
    /// Positional record; binds to tuples.
    Tuple(Vec<Shape>),
    /// Named record; binds to named tuples and objects. Field names bind
    /// to wire names case-sensitively.
    Record(Vec<(String, Shape)>),
    /// Enum decoded as its string member.
    EnumStr,
    /// Accept whatever the wire declares, decoding to the natural
    /// [`crate::Value`] for each descriptor.
    Dynamic,
}

impl Shape {
    pub fn optional(inner: Shape) -> Shape {
        Shape::Optional(Box::new(inner))
    }

    pub fn list(element: Shape) -> Shape {
        Shape::List(Box::new(element))
    }

    pub fn record<I>(fields: I) -> Shape
    where
        I: IntoIterator<Item = (&'static str, Shape)>,
    {
        Shape::Record(
            fields
                .into_iter()
                .map(|(name, shape)| (name.to_string(), shape))
                .collect(),
        )
    }

    /// Stable structural fingerprint.
    pub fn id(&self) -> ShapeId {
        let mut hasher = Fnv1a::new();
        self.feed(&mut hasher);
        ShapeId(hasher.finish())
    }

    fn feed(&self, h: &mut Fnv1a) {
        match self {
            Shape::Scalar(kind) => {
                h.byte(0x01);
                h.byte(*kind as u8);
            }
            Shape::Optional(inner) => {
                h.byte(0x02);
                inner.feed(h);
            }
            Shape::List(element) => {
                h.byte(0x03);
                element.feed(h);
            }
            Shape::Tuple(elements) => {
                h.byte(0x04);
                h.len(elements.len());
                for e in elements {
                    e.feed(h);
                }
            }
            Shape::Record(fields) => {
                h.byte(0x05);
                h.len(fields.len());
                for (name, shape) in fields {
                    h.str(name);
                    shape.feed(h);
                }
            }
            Shape::EnumStr => h.byte(0x06),
            Shape::Dynamic => h.byte(0x07),
        }
    }
}

/// Fingerprint of a [`Shape`]; part of the decoder cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId(pub u64);

/// FNV-1a. The std hasher is randomly keyed per process, which would make
/// shape ids unstable; the decoder cache key must not depend on that.
struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Fnv1a(0xcbf2_9ce4_8422_2325)
    }

    fn byte(&mut self, b: u8) {
        self.0 ^= b as u64;
        self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
    }

    fn bytes(&mut self, raw: &[u8]) {
        for &b in raw {
            self.byte(b);
        }
    }

    fn len(&mut self, n: usize) {
        self.bytes(&(n as u32).to_be_bytes());
    }

    fn str(&mut self, s: &str) {
        self.len(s.len());
        self.bytes(s.as_bytes());
    }

    fn finish(self) -> u64 {
        self.0
    }
}
