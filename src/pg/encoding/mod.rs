//! Binary wire encodings.
//!
//! Each `Encoding` is a pure pair of functions between one native datum and
//! its PostgreSQL binary representation. The registry maps OIDs to erased
//! codecs and derives an array codec for every registered element type.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

mod array;
mod numeric;
mod primitive;
mod temporal;


use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;

use super::types::Oid;
use crate::error::{Error, Result};
use crate::value::{Kind, Native, Value};

pub use array::ArrayEncoding;
pub use numeric::NumericEncoding;
pub use primitive::{
    BoolEncoding, ByteaEncoding, Float4Encoding, Float8Encoding, Int2Encoding, Int4Encoding,
    Int8Encoding, TextEncoding,
};
pub use temporal::{
    DateEncoding, TimeEncoding, TimestampEncoding, TimestampTzEncoding, TimeTzEncoding,
};

// ============================================================================
// Encoding traits
// ============================================================================

/// Typed encode/decode pair for one native datum.
pub trait Encoding: Send + Sync + 'static {
    type Item: Native;

    fn encode(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<()>;

    fn decode(&self, data: &[u8]) -> Result<Self::Item>;
}

/// Type-erased codec working on `Value`.
pub trait Codec: Send + Sync {
    /// Kind produced by `decode_value`.
    fn kind(&self) -> Kind;

    fn encode_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()>;

    fn decode_value(&self, data: &[u8]) -> Result<Value>;
}

/// Adapts a typed `Encoding` to `Codec`.
pub struct Scalar<E>(pub E);

impl<E: Encoding> Codec for Scalar<E> {
    fn kind(&self) -> Kind {
        <E::Item as Native>::KIND
    }

    fn encode_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        match E::Item::borrow_from(value) {
            Some(item) => self.0.encode(item, buf),
            None => Err(Error::TypeMismatch {
                requested: self.kind(),
                actual: value.kind(),
            }),
        }
    }

    fn decode_value(&self, data: &[u8]) -> Result<Value> {
        self.0.decode(data).map(Native::into_value)
    }
}

/// Read exactly `N` bytes for a fixed-width type.
pub(crate) fn fixed<const N: usize>(data: &[u8], type_name: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        Error::InvalidValue(format!(
            "invalid {} length: expected {}, got {}",
            type_name,
            N,
            data.len()
        ))
    })
}

// ============================================================================
// Registry
// ============================================================================

static REGISTRY: Lazy<EncodingRegistry> = Lazy::new(EncodingRegistry::postgres);

/// The process-wide registry with every built-in encoding.
pub fn registry() -> &'static EncodingRegistry {
    &REGISTRY
}

/// Immutable OID → codec table.
pub struct EncodingRegistry {
    by_oid: HashMap<Oid, Arc<dyn Codec>>,
    /// Primary OID for each scalar kind (the first one registered).
    by_kind: HashMap<Kind, Oid>,
    /// Primary array OID for each element kind.
    arrays_by_kind: HashMap<Kind, Oid>,
}

impl EncodingRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with the built-in PostgreSQL encodings.
    pub fn postgres() -> Self {
        Self::builder()
            .register(&[Oid::BOOL], BoolEncoding)
            .register(&[Oid::INT2], Int2Encoding)
            .register(&[Oid::INT4], Int4Encoding)
            .register(&[Oid::INT8], Int8Encoding)
            .register(&[Oid::FLOAT4], Float4Encoding)
            .register(&[Oid::FLOAT8], Float8Encoding)
            .register(&[Oid::NUMERIC], NumericEncoding)
            .register(
                &[
                    Oid::TEXT,
                    Oid::VARCHAR,
                    Oid::BPCHAR,
                    Oid::NAME,
                    Oid::XML,
                    Oid::JSON,
                ],
                TextEncoding,
            )
            .register(&[Oid::BYTEA], ByteaEncoding)
            .register(&[Oid::DATE], DateEncoding)
            .register(&[Oid::TIME], TimeEncoding)
            .register(&[Oid::TIMETZ], TimeTzEncoding)
            .register(&[Oid::TIMESTAMP], TimestampEncoding)
            .register(&[Oid::TIMESTAMPTZ], TimestampTzEncoding)
            .build()
    }

    /// Codec for a wire type.
    pub fn lookup(&self, oid: Oid) -> Result<&dyn Codec> {
        self.by_oid
            .get(&oid)
            .map(|codec| codec.as_ref())
            .ok_or(Error::UnknownType(oid))
    }

    /// Primary OID and codec for a scalar kind.
    pub fn lookup_kind(&self, kind: Kind) -> Result<(Oid, &dyn Codec)> {
        let oid = self
            .by_kind
            .get(&kind)
            .copied()
            .ok_or_else(|| Error::InvalidValue(format!("no encoding registered for {}", kind)))?;
        Ok((oid, self.lookup(oid)?))
    }

    /// Primary array OID and codec for arrays of `element`.
    pub fn lookup_array(&self, element: Kind) -> Result<(Oid, &dyn Codec)> {
        let oid = self.arrays_by_kind.get(&element).copied().ok_or_else(|| {
            Error::InvalidValue(format!("no array encoding registered for {}", element))
        })?;
        Ok((oid, self.lookup(oid)?))
    }

    /// Resolve the encode side of a bound value. NULL has no codec and
    /// binds as `Oid::UNSPECIFIED`.
    pub fn for_value(&self, value: &Value) -> Result<Option<(Oid, &dyn Codec)>> {
        match value {
            Value::Null => Ok(None),
            Value::Array(array) => self.lookup_array(array.element_kind()).map(Some),
            other => self.lookup_kind(other.kind()).map(Some),
        }
    }

    /// Encode a parameter: its type OID and payload (`None` for NULL).
    pub fn encode(&self, value: &Value) -> Result<(Oid, Option<Bytes>)> {
        match self.for_value(value)? {
            None => Ok((Oid::UNSPECIFIED, None)),
            Some((oid, codec)) => {
                let mut buf = BytesMut::new();
                codec.encode_value(value, &mut buf)?;
                Ok((oid, Some(buf.freeze())))
            }
        }
    }

    /// Decode a column; `None` is SQL NULL.
    pub fn decode(&self, oid: Oid, data: Option<&[u8]>) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(bytes) => self.lookup(oid)?.decode_value(bytes),
        }
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.by_oid.contains_key(&oid)
    }
}

/// Collects encodings before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    by_oid: HashMap<Oid, Arc<dyn Codec>>,
    by_kind: HashMap<Kind, Oid>,
    arrays_by_kind: HashMap<Kind, Oid>,
}

impl RegistryBuilder {
    /// Register `encoding` for every OID in `oids`, along with the array
    /// type of each of them.
    pub fn register<E: Encoding>(mut self, oids: &[Oid], encoding: E) -> Self {
        let codec: Arc<dyn Codec> = Arc::new(Scalar(encoding));
        let kind = codec.kind();

        for &oid in oids {
            self.by_oid.insert(oid, Arc::clone(&codec));
            self.by_kind.entry(kind).or_insert(oid);

            if let Some(array_oid) = oid.array_type() {
                let array: Arc<dyn Codec> = Arc::new(ArrayEncoding::new(Arc::clone(&codec), oid));
                self.by_oid.insert(array_oid, array);
                self.arrays_by_kind.entry(kind).or_insert(array_oid);
            }
        }
        self
    }

    pub fn build(self) -> EncodingRegistry {
        tracing::debug!(types = self.by_oid.len(), "encoding registry built");
        EncodingRegistry {
            by_oid: self.by_oid,
            by_kind: self.by_kind,
            arrays_by_kind: self.arrays_by_kind,
        }
    }
}
