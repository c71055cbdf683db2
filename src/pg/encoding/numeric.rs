//! NUMERIC in its packed base-10000 binary form.
//!
//! Layout: `ndigits: i16`, `weight: i16` (power of 10000 of the first digit),
//! `sign: u16`, `dscale: u16` (decimal digits after the point), then
//! `ndigits` base-10000 digits, most significant first. Conversion to and
//! from `Decimal` goes through its integer mantissa, so no precision is lost.

use bytes::{BufMut, BytesMut};
use rust_decimal::Decimal;

use super::Encoding;
use crate::error::{Error, Result};

const NBASE: u128 = 10_000;
const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

/// Largest scale a `Decimal` can carry.
const MAX_SCALE: u32 = 28;

pub struct NumericEncoding;

impl Encoding for NumericEncoding {
    type Item = Decimal;

    fn encode(&self, item: &Decimal, buf: &mut BytesMut) -> Result<()> {
        let scale = item.scale();
        let sign = if item.is_sign_negative() && !item.is_zero() {
            SIGN_NEG
        } else {
            SIGN_POS
        };

        // Pad the fraction to whole base-10000 groups.
        let pad = (4 - scale % 4) % 4;
        let mut mantissa = item.mantissa().unsigned_abs() * 10u128.pow(pad);
        let frac_groups = ((scale + pad) / 4) as i32;

        let mut digits: Vec<i16> = Vec::new();
        while mantissa > 0 {
            digits.push((mantissa % NBASE) as i16);
            mantissa /= NBASE;
        }
        digits.reverse();

        let weight = digits.len() as i32 - 1 - frac_groups;
        while digits.last() == Some(&0) {
            digits.pop();
        }

        buf.put_i16(digits.len() as i16);
        buf.put_i16(if digits.is_empty() { 0 } else { weight as i16 });
        buf.put_u16(sign);
        buf.put_u16(scale as u16);
        for digit in digits {
            buf.put_i16(digit);
        }
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<Decimal> {
        if data.len() < 8 {
            return Err(Error::InvalidValue(format!(
                "NUMERIC too short: {} bytes",
                data.len()
            )));
        }

        let ndigits = i16::from_be_bytes([data[0], data[1]]);
        let weight = i16::from_be_bytes([data[2], data[3]]) as i32;
        let sign = u16::from_be_bytes([data[4], data[5]]);
        let dscale = u16::from_be_bytes([data[6], data[7]]) as u32;

        match sign {
            SIGN_POS | SIGN_NEG => {}
            SIGN_NAN => return Err(Error::InvalidValue("NUMERIC NaN".to_string())),
            SIGN_PINF | SIGN_NINF => {
                return Err(Error::InvalidValue("NUMERIC infinity".to_string()))
            }
            other => {
                return Err(Error::InvalidValue(format!(
                    "invalid NUMERIC sign 0x{:04x}",
                    other
                )))
            }
        }

        let ndigits = usize::try_from(ndigits)
            .map_err(|_| Error::InvalidValue("negative NUMERIC digit count".to_string()))?;
        if data.len() != 8 + ndigits * 2 {
            return Err(Error::InvalidValue(format!(
                "NUMERIC with {} digits has {} bytes",
                ndigits,
                data.len()
            )));
        }
        if dscale > MAX_SCALE {
            return Err(out_of_range());
        }

        let mut mantissa: u128 = 0;
        for chunk in data[8..].chunks_exact(2) {
            let digit = i16::from_be_bytes([chunk[0], chunk[1]]);
            if !(0..10_000).contains(&digit) {
                return Err(Error::InvalidValue(format!(
                    "invalid NUMERIC digit {}",
                    digit
                )));
            }
            mantissa = mantissa
                .checked_mul(NBASE)
                .and_then(|m| m.checked_add(digit as u128))
                .ok_or_else(out_of_range)?;
        }

        // Power of 10000 of the last digit.
        let exponent = weight - (ndigits as i32 - 1);
        let mut scale: u32 = 0;
        if ndigits > 0 {
            if exponent >= 0 {
                mantissa = mantissa
                    .checked_mul(NBASE.checked_pow(exponent as u32).ok_or_else(out_of_range)?)
                    .ok_or_else(out_of_range)?;
            } else {
                scale = (-exponent) as u32 * 4;
            }
        }

        // Bring the digits to the display scale; dropped digits are zeros.
        while scale > dscale && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        while scale < dscale {
            mantissa = mantissa.checked_mul(10).ok_or_else(out_of_range)?;
            scale += 1;
        }
        if scale > MAX_SCALE {
            return Err(out_of_range());
        }

        let signed = i128::try_from(mantissa).map_err(|_| out_of_range())?;
        let signed = if sign == SIGN_NEG { -signed } else { signed };
        Decimal::try_from_i128_with_scale(signed, scale).map_err(|_| out_of_range())
    }
}

fn out_of_range() -> Error {
    Error::InvalidValue("NUMERIC value out of Decimal range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn encode(text: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        NumericEncoding
            .encode(&Decimal::from_str(text).unwrap(), &mut buf)
            .unwrap();
        buf.to_vec()
    }

    fn words(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_packs_like_the_server() {
        // 12345.678: digits [1, 2345, 6780], weight 1, dscale 3
        assert_eq!(words(&encode("12345.678")), vec![3, 1, 0, 3, 1, 2345, 6780]);
        // 0.0001: one digit at weight -1
        assert_eq!(words(&encode("0.0001")), vec![1, -1, 0, 4, 1]);
        // trailing zero groups are dropped, weight kept
        assert_eq!(words(&encode("10000")), vec![1, 1, 0, 0, 1]);
        // zero carries only its scale
        assert_eq!(words(&encode("0.00")), vec![0, 0, 0, 2]);
        assert_eq!(words(&encode("-1.5")), vec![2, 0, 0x4000, 1, 1, 5000]);
    }

    #[test]
    fn test_decode_preserves_scale() {
        for text in ["1.50", "-0.001", "79228162514264337593543950335", "0.0000000001", "0"] {
            let decoded = NumericEncoding.decode(&encode(text)).unwrap();
            assert_eq!(decoded.to_string(), text);
        }
    }

    #[test]
    fn test_decode_rejects_nan() {
        let nan = [0u8, 0, 0, 0, 0xC0, 0, 0, 0];
        assert!(matches!(
            NumericEncoding.decode(&nan),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_digits() {
        let data = [0u8, 2, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            NumericEncoding.decode(&data),
            Err(Error::InvalidValue(_))
        ));
    }
}
