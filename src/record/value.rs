//! Runtime values and typed primitive access.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::field::FieldType;

/// Natively typed value read from a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    BitField(u64),
    Float(f32),
    Double(f64),
    Time8(f64),
    Text(String),
}

impl Value {
    /// Numeric view; text parses or reads as 0.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int8(v) => f64::from(*v),
            Value::Int16(v) => f64::from(*v),
            Value::Int32(v) => f64::from(*v),
            Value::Int64(v) => *v as f64,
            Value::UInt8(v) => f64::from(*v),
            Value::UInt16(v) => f64::from(*v),
            Value::UInt32(v) => f64::from(*v),
            Value::UInt64(v) | Value::BitField(v) => *v as f64,
            Value::Float(v) => f64::from(*v),
            Value::Double(v) | Value::Time8(v) => *v,
            Value::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    /// Integer view; reals truncate toward zero.
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int8(v) => i64::from(*v),
            Value::Int16(v) => i64::from(*v),
            Value::Int32(v) => i64::from(*v),
            Value::Int64(v) => *v,
            Value::UInt8(v) => i64::from(*v),
            Value::UInt16(v) => i64::from(*v),
            Value::UInt32(v) => i64::from(*v),
            Value::UInt64(v) | Value::BitField(v) => *v as i64,
            Value::Float(v) => *v as i64,
            Value::Double(v) | Value::Time8(v) => *v as i64,
            Value::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) | Value::BitField(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) | Value::Time8(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Primitive types that can be read from and written to a record field.
pub trait FieldData: Sized + Copy {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Whether a field of `field_type` stores this primitive.
    fn matches(field_type: FieldType) -> bool;

    /// Decodes from exactly `SIZE` bytes.
    fn decode(bytes: &[u8], big_endian: bool) -> Self;

    /// Encodes into exactly `SIZE` bytes.
    fn encode(self, out: &mut [u8], big_endian: bool);
}

macro_rules! impl_field_data {
    ($($ty:ty => $($ft:ident)|+),* $(,)?) => {
        $(
            impl FieldData for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn matches(field_type: FieldType) -> bool {
                    matches!(field_type, $(FieldType::$ft)|+)
                }

                fn decode(bytes: &[u8], big_endian: bool) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    if big_endian { <$ty>::from_be_bytes(raw) } else { <$ty>::from_le_bytes(raw) }
                }

                fn encode(self, out: &mut [u8], big_endian: bool) {
                    let raw = if big_endian { self.to_be_bytes() } else { self.to_le_bytes() };
                    out[..Self::SIZE].copy_from_slice(&raw);
                }
            }
        )*
    };
}

impl_field_data! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8 | String,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64 | Time8,
    f32 => Float,
    f64 => Double,
}

/// Reads `len` bits starting at `bit_offset`, most significant bit first.
pub(crate) fn unpack_bits(data: &[u8], bit_offset: usize, len: usize) -> Option<u64> {
    if len == 0 || len > 64 || (bit_offset + len).div_ceil(8) > data.len() {
        return None;
    }
    let mut value = 0u64;
    for bit in bit_offset..bit_offset + len {
        let set = (data[bit / 8] >> (7 - bit % 8)) & 1;
        value = (value << 1) | u64::from(set);
    }
    Some(value)
}

/// Writes the low `len` bits of `value` starting at `bit_offset`.
pub(crate) fn pack_bits(data: &mut [u8], bit_offset: usize, len: usize, value: u64) -> bool {
    if len == 0 || len > 64 || (bit_offset + len).div_ceil(8) > data.len() {
        return false;
    }
    for (i, bit) in (bit_offset..bit_offset + len).enumerate() {
        let set = (value >> (len - 1 - i)) & 1;
        let mask = 1u8 << (7 - bit % 8);
        if set == 1 {
            data[bit / 8] |= mask;
        } else {
            data[bit / 8] &= !mask;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn numeric_views_upcast() {
        assert_eq!(Value::Int8(-3).as_f64(), -3.0);
        assert_eq!(Value::Float(2.5).as_i64(), 2);
        assert_eq!(Value::UInt64(7).as_i64(), 7);
        assert_eq!(Value::Text(" 42 ".into()).as_i64(), 42);
        assert_eq!(Value::Text("x".into()).as_f64(), 0.0);
        assert_eq!(Value::Int32(-9).to_string(), "-9");
    }

    #[test]
    fn endianness_is_respected() {
        let mut buf = [0u8; 4];
        0x0102_0304u32.encode(&mut buf, true);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(u32::decode(&buf, false), 0x0403_0201);
        assert!(u64::matches(FieldType::Time8));
        assert!(!f32::matches(FieldType::Double));
    }

    #[test]
    fn bits_pack_msb_first() {
        let mut buf = [0u8; 2];
        assert!(pack_bits(&mut buf, 3, 6, 0b101101));
        assert_eq!(buf, [0b0001_0110, 0b1000_0000]);
        assert_eq!(unpack_bits(&buf, 3, 6), Some(0b101101));
        assert_eq!(unpack_bits(&buf, 12, 8), None);
    }

    proptest! {
        #[test]
        fn bitfields_round_trip(offset in 0usize..32, len in 1usize..=32, raw in any::<u64>()) {
            let value = raw & ((1u64 << len) - 1);
            let mut buf = [0xA5u8; 8];
            prop_assert!(pack_bits(&mut buf, offset, len, value));
            prop_assert_eq!(unpack_bits(&buf, offset, len), Some(value));
        }
    }
}
