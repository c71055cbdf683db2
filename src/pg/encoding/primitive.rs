//! Boolean, integer, floating point, text and bytea encodings.

use bytes::{BufMut, BytesMut};

use super::{fixed, Encoding};
use crate::error::{Error, Result};

pub struct BoolEncoding;

impl Encoding for BoolEncoding {
    type Item = bool;

    fn encode(&self, item: &bool, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(u8::from(*item));
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<bool> {
        let [b] = fixed::<1>(data, "BOOL")?;
        Ok(b != 0)
    }
}

pub struct Int2Encoding;

impl Encoding for Int2Encoding {
    type Item = i16;

    fn encode(&self, item: &i16, buf: &mut BytesMut) -> Result<()> {
        buf.put_i16(*item);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<i16> {
        Ok(i16::from_be_bytes(fixed(data, "INT2")?))
    }
}

pub struct Int4Encoding;

impl Encoding for Int4Encoding {
    type Item = i32;

    fn encode(&self, item: &i32, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(*item);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<i32> {
        Ok(i32::from_be_bytes(fixed(data, "INT4")?))
    }
}

pub struct Int8Encoding;

impl Encoding for Int8Encoding {
    type Item = i64;

    fn encode(&self, item: &i64, buf: &mut BytesMut) -> Result<()> {
        buf.put_i64(*item);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<i64> {
        Ok(i64::from_be_bytes(fixed(data, "INT8")?))
    }
}

/// IEEE-754 single precision; the binary format carries the exact bits.
pub struct Float4Encoding;

impl Encoding for Float4Encoding {
    type Item = f32;

    fn encode(&self, item: &f32, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(item.to_bits());
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<f32> {
        Ok(f32::from_bits(u32::from_be_bytes(fixed(data, "FLOAT4")?)))
    }
}

pub struct Float8Encoding;

impl Encoding for Float8Encoding {
    type Item = f64;

    fn encode(&self, item: &f64, buf: &mut BytesMut) -> Result<()> {
        buf.put_u64(item.to_bits());
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(fixed(data, "FLOAT8")?)))
    }
}

/// text, varchar, bpchar, name, xml and json all travel as UTF-8 bytes.
pub struct TextEncoding;

impl Encoding for TextEncoding {
    type Item = String;

    fn encode(&self, item: &String, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(item.as_bytes());
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<String> {
        std::str::from_utf8(data)
            .map(str::to_owned)
            .map_err(|e| Error::InvalidValue(format!("invalid UTF-8 in text: {}", e)))
    }
}

pub struct ByteaEncoding;

impl Encoding for ByteaEncoding {
    type Item = Vec<u8>;

    fn encode(&self, item: &Vec<u8>, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(item);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
