//! Arbitrary-precision numeric wire layouts.
//!
//! BigInt payload: `n:u16 | weight:u16 | sign:u16 | reserved:u16 |
//! digits[n]:u16_be`. Digits are base-10000 chunks, most significant
//! first; the value is `Σ digit_i · 10000^(weight - i)`. `sign == 0x4000`
//! marks a negative value. The encoder emits the minimal digit sequence:
//! trailing zero digits are folded into the weight, and zero encodes with
//! `n = 0`.

use crate::buff::{Reader, Writer};
use crate::errors::{Error, Result};
use crate::value::{BigInt, Value};

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;

pub fn decode_bigint(r: &mut Reader) -> Result<Value> {
    let n = r.pop_u16()? as usize;
    let weight = r.pop_u16()? as i64;
    let sign = r.pop_u16()?;
    r.discard(2)?; // reserved

    let negative = match sign {
        SIGN_POS => false,
        SIGN_NEG => true,
        other => {
            return Err(Error::invalid_type(format!(
                "invalid bigint sign {:#06x}",
                other
            )))
        }
    };

    if n == 0 {
        r.expect_end()?;
        return Ok(Value::BigInt(BigInt::zero()));
    }

    // weight - (n - 1) trailing implicit zero digits; a negative count
    // would mean fractional digits, which a bigint cannot carry
    let implicit_zeros = weight - (n as i64 - 1);
    if implicit_zeros < 0 {
        return Err(Error::invalid_type(
            "bigint payload carries fractional digits",
        ));
    }

    let mut digits = Vec::with_capacity(n + implicit_zeros as usize);
    for _ in 0..n {
        let digit = r.pop_u16()?;
        if digit >= 10_000 {
            return Err(Error::invalid_type(format!(
                "bigint digit {} out of base-10000 range",
                digit
            )));
        }
        digits.push(digit);
    }
    digits.resize(n + implicit_zeros as usize, 0);
    r.expect_end()?;

    Ok(Value::BigInt(BigInt::from_digits(negative, digits)))
}

pub fn encode_bigint(w: &mut Writer, value: &BigInt) {
    if value.is_zero() {
        w.push_u16(0);
        w.push_u16(0);
        w.push_u16(SIGN_POS);
        w.push_u16(0);
        return;
    }

    let digits = value.digits();
    let weight = (digits.len() - 1) as u16;
    let significant = digits
        .iter()
        .rposition(|&d| d != 0)
        .map(|i| i + 1)
        .unwrap_or(0);

    w.push_u16(significant as u16);
    w.push_u16(weight);
    w.push_u16(if value.is_negative() { SIGN_NEG } else { SIGN_POS });
    w.push_u16(0);
    for &d in &digits[..significant] {
        w.push_u16(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode_to_bytes(value: &BigInt) -> Bytes {
        let mut w = Writer::new();
        encode_bigint(&mut w, value);
        w.take()
    }

    fn decode_from(raw: Bytes) -> BigInt {
        let mut r = Reader::new(raw);
        match decode_bigint(&mut r).unwrap() {
            Value::BigInt(v) => v,
            other => panic!("expected bigint, got {:?}", other),
        }
    }

    #[test]
    fn large_value_roundtrips() {
        let n: BigInt = "12345678901234567890".parse().unwrap();
        assert_eq!(decode_from(encode_to_bytes(&n)), n);

        let neg = n.negate();
        assert_eq!(decode_from(encode_to_bytes(&neg)), neg);
    }

    #[test]
    fn negation_flips_only_the_sign_word() {
        let n: BigInt = "98765432109876543210".parse().unwrap();
        let pos = encode_to_bytes(&n);
        let neg = encode_to_bytes(&n.negate());

        assert_eq!(pos.len(), neg.len());
        assert_eq!(&pos[..4], &neg[..4]);
        assert_eq!(&pos[6..], &neg[6..]);
        assert_eq!(u16::from_be_bytes([pos[4], pos[5]]), 0x0000);
        assert_eq!(u16::from_be_bytes([neg[4], neg[5]]), 0x4000);
    }

    #[test]
    fn zero_encodes_as_bare_header() {
        let raw = encode_to_bytes(&BigInt::zero());
        assert_eq!(raw.len(), 8);
        assert_eq!(u16::from_be_bytes([raw[0], raw[1]]), 0);
        assert_eq!(decode_from(raw), BigInt::zero());
    }

    #[test]
    fn trailing_zero_digits_fold_into_weight() {
        // 3 * 10000^2 = 300000000
        let n: BigInt = "300000000".parse().unwrap();
        let raw = encode_to_bytes(&n);
        assert_eq!(u16::from_be_bytes([raw[0], raw[1]]), 1); // one digit
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 2); // weight 2
        assert_eq!(decode_from(raw), n);
    }

    #[test]
    fn fractional_weight_is_rejected() {
        let mut w = Writer::new();
        w.push_u16(2); // two digits
        w.push_u16(0); // weight 0: second digit would be fractional
        w.push_u16(0);
        w.push_u16(0);
        w.push_u16(1);
        w.push_u16(2);
        let mut r = Reader::new(w.take());
        assert!(decode_bigint(&mut r).is_err());
    }

    #[test]
    fn out_of_range_digit_is_rejected() {
        let mut w = Writer::new();
        w.push_u16(1);
        w.push_u16(0);
        w.push_u16(0);
        w.push_u16(0);
        w.push_u16(10_000);
        let mut r = Reader::new(w.take());
        assert!(decode_bigint(&mut r).is_err());
    }
}
