//! Generic array encoding.
//!
//! Binary layout:
//! - Int32: number of dimensions (0 for an empty array)
//! - Int32: 1 if any element is NULL
//! - Int32: element type OID
//! - per dimension: Int32 length, Int32 lower bound
//! - per element, row-major: Int32 length (-1 for NULL) then the payload

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use super::Codec;
use crate::error::{Error, Result};
use crate::pg::types::Oid;
use crate::value::{Array, Dimension, Kind, Value, MAX_ARRAY_DIMENSIONS};

/// Array codec built from the codec of its element type.
pub struct ArrayEncoding {
    element: Arc<dyn Codec>,
    element_oid: Oid,
}

impl ArrayEncoding {
    pub fn new(element: Arc<dyn Codec>, element_oid: Oid) -> Self {
        Self {
            element,
            element_oid,
        }
    }

    pub fn element_oid(&self) -> Oid {
        self.element_oid
    }
}

impl Codec for ArrayEncoding {
    fn kind(&self) -> Kind {
        Kind::Array
    }

    fn encode_value(&self, value: &Value, buf: &mut BytesMut) -> Result<()> {
        let array = value.as_array()?;
        if array.element_kind() != self.element.kind() {
            return Err(Error::TypeMismatch {
                requested: self.element.kind(),
                actual: array.element_kind(),
            });
        }

        let declared = array
            .dimensions()
            .iter()
            .try_fold(1usize, |n, dim| n.checked_mul(usize::try_from(dim.len).ok()?));
        let consistent = match array.dimensions() {
            [] => array.is_empty(),
            _ => declared == Some(array.len()),
        };
        if !consistent {
            return Err(Error::InvalidArray(format!(
                "{} elements do not fill the declared dimensions",
                array.len()
            )));
        }

        buf.put_i32(array.dimensions().len() as i32);
        buf.put_i32(i32::from(array.has_nulls()));
        buf.put_i32(self.element_oid.as_i32());
        for dim in array.dimensions() {
            buf.put_i32(dim.len);
            buf.put_i32(dim.lower_bound);
        }

        for element in array.elements() {
            if element.is_null() {
                buf.put_i32(-1);
                continue;
            }
            let len_pos = buf.len();
            buf.put_i32(0);
            self.element.encode_value(element, buf)?;
            let len = (buf.len() - len_pos - 4) as i32;
            buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    fn decode_value(&self, mut data: &[u8]) -> Result<Value> {
        let ndim = take_i32(&mut data)?;
        let _has_nulls = take_i32(&mut data)?;
        let element_oid = Oid::from_i32(take_i32(&mut data)?);

        let ndim = usize::try_from(ndim)
            .ok()
            .filter(|n| *n <= MAX_ARRAY_DIMENSIONS)
            .ok_or_else(|| Error::InvalidArray(format!("invalid dimension count {}", ndim)))?;
        if element_oid != self.element_oid {
            return Err(Error::InvalidArray(format!(
                "element type {} does not match expected {}",
                element_oid, self.element_oid
            )));
        }

        let mut dimensions = Vec::with_capacity(ndim);
        let mut count: usize = if ndim == 0 { 0 } else { 1 };
        for _ in 0..ndim {
            let len = take_i32(&mut data)?;
            let lower_bound = take_i32(&mut data)?;
            let extent = usize::try_from(len)
                .map_err(|_| Error::InvalidArray(format!("negative dimension {}", len)))?;
            count = count
                .checked_mul(extent)
                .ok_or_else(|| Error::InvalidArray("dimensions overflow".to_string()))?;
            dimensions.push(Dimension { len, lower_bound });
        }

        // Every element needs at least its length word.
        if count > data.remaining() / 4 {
            return Err(Error::InvalidArray(format!(
                "{} elements do not fit in {} bytes",
                count,
                data.remaining()
            )));
        }

        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            let len = take_i32(&mut data)?;
            if len == -1 {
                elements.push(Value::Null);
                continue;
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= data.remaining())
                .ok_or_else(|| Error::InvalidArray(format!("invalid element length {}", len)))?;
            let (payload, rest) = data.split_at(len);
            elements.push(self.element.decode_value(payload)?);
            data = rest;
        }

        if data.has_remaining() {
            return Err(Error::InvalidArray(format!(
                "{} trailing bytes after elements",
                data.remaining()
            )));
        }

        Array::with_dimensions(self.element.kind(), dimensions, elements).map(Value::Array)
    }
}

fn take_i32(data: &mut &[u8]) -> Result<i32> {
    if data.remaining() < 4 {
        return Err(Error::InvalidArray("truncated array header".to_string()));
    }
    Ok(data.get_i32())
}
