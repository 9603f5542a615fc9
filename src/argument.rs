//! Wire types and the traits that put values into a message buffer.
//!
//! Every value in a message buffer starts with a one-byte [`ArgumentType`]
//! discriminant. When a format specifier accompanies the value the
//! discriminant has [`FORMAT_FLAG`] set and a two-byte string-table index for
//! the specifier follows the payload. All multi-byte payloads are little
//! endian.
//!
//! | Type | Payload |
//! |------|---------|
//! | `Null` | none |
//! | `Bool`, `U8`, `I8` | 1 byte |
//! | `U16`, `I16` | 2 bytes |
//! | `U32`, `I32`, `F32`, `Char` | 4 bytes |
//! | `U64`, `I64`, `Usize`, `Isize`, `F64` | 8 bytes |
//! | `DateTime` | `i64` seconds + `u32` nanoseconds since the Unix epoch |
//! | `TimeSpan` | `u64` seconds + `u32` nanoseconds |
//! | `Guid` | 16 bytes |
//! | `Decimal` | `i128` mantissa + `u8` scale |
//! | `String`, `FormatString`, `KeyString` | `u16` string-table index |
//! | `InlineString` | `u16` length + UTF-8 bytes |
//! | `Enum` | `u32` type id + `u64` raw value |
//! | `Unmanaged` | `u32` type id + `u16` length + raw bytes |
//! | `EndOfTruncatedMessage` | none, always last |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::Message;
use crate::type_registry::LogEnum;

/// Set on a discriminant when a format specifier index follows the payload.
pub const FORMAT_FLAG: u8 = 0x80;

/// One-byte tag identifying the wire type of the next encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentType {
    Null = 1,
    Bool = 2,
    U8 = 3,
    I8 = 4,
    U16 = 5,
    I16 = 6,
    U32 = 7,
    I32 = 8,
    U64 = 9,
    I64 = 10,
    Usize = 11,
    Isize = 12,
    F32 = 13,
    F64 = 14,
    Decimal = 15,
    Char = 16,
    Guid = 17,
    DateTime = 18,
    TimeSpan = 19,
    String = 20,
    InlineString = 21,
    Enum = 22,
    Unmanaged = 23,
    FormatString = 24,
    KeyString = 25,
    EndOfTruncatedMessage = 0x7F,
}

impl ArgumentType {
    pub const fn from_u8(tag: u8) -> Option<ArgumentType> {
        use ArgumentType::*;
        Some(match tag {
            1 => Null,
            2 => Bool,
            3 => U8,
            4 => I8,
            5 => U16,
            6 => I16,
            7 => U32,
            8 => I32,
            9 => U64,
            10 => I64,
            11 => Usize,
            12 => Isize,
            13 => F32,
            14 => F64,
            15 => Decimal,
            16 => Char,
            17 => Guid,
            18 => DateTime,
            19 => TimeSpan,
            20 => String,
            21 => InlineString,
            22 => Enum,
            23 => Unmanaged,
            24 => FormatString,
            25 => KeyString,
            0x7F => EndOfTruncatedMessage,
            _ => return None,
        })
    }
}

/// A fixed-size value written as its raw little-endian representation.
pub trait Primitive: Copy {
    const TYPE: ArgumentType;
    const SIZE: usize;

    /// Writes exactly `Self::SIZE` bytes into `out`.
    fn write_to(self, out: &mut [u8]);
}

/// Anything that can be appended to a [`Message`].
///
/// Implemented for every [`Primitive`], for string references, for
/// [`EnumArg`] and for `Option` of any of those (absent values encode as
/// `Null`).
pub trait Encode {
    fn encode(self, message: &mut Message, format: Option<&'static str>);
}

macro_rules! le_primitive {
    ($($ty:ty => $tag:ident, $size:expr;)*) => {$(
        impl Primitive for $ty {
            const TYPE: ArgumentType = ArgumentType::$tag;
            const SIZE: usize = $size;

            #[inline(always)]
            fn write_to(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }

        impl Encode for $ty {
            #[inline(always)]
            fn encode(self, message: &mut Message, format: Option<&'static str>) {
                message.write_primitive(self, format);
            }
        }
    )*};
}

le_primitive! {
    u8 => U8, 1;
    i8 => I8, 1;
    u16 => U16, 2;
    i16 => I16, 2;
    u32 => U32, 4;
    i32 => I32, 4;
    u64 => U64, 8;
    i64 => I64, 8;
    f32 => F32, 4;
    f64 => F64, 8;
}

macro_rules! other_primitive {
    ($($ty:ty => $tag:ident, $size:expr, |$v:ident, $out:ident| $body:block;)*) => {$(
        impl Primitive for $ty {
            const TYPE: ArgumentType = ArgumentType::$tag;
            const SIZE: usize = $size;

            #[inline(always)]
            fn write_to(self, $out: &mut [u8]) {
                let $v = self;
                $body
            }
        }

        impl Encode for $ty {
            #[inline(always)]
            fn encode(self, message: &mut Message, format: Option<&'static str>) {
                message.write_primitive(self, format);
            }
        }
    )*};
}

other_primitive! {
    bool => Bool, 1, |v, out| { out[0] = v as u8; };
    usize => Usize, 8, |v, out| { out.copy_from_slice(&(v as u64).to_le_bytes()); };
    isize => Isize, 8, |v, out| { out.copy_from_slice(&(v as i64).to_le_bytes()); };
    char => Char, 4, |v, out| { out.copy_from_slice(&(v as u32).to_le_bytes()); };
    Decimal => Decimal, 17, |v, out| {
        out[..16].copy_from_slice(&v.mantissa.to_le_bytes());
        out[16] = v.scale;
    };
    Uuid => Guid, 16, |v, out| { out.copy_from_slice(v.as_bytes()); };
    DateTime<Utc> => DateTime, 12, |v, out| {
        out[..8].copy_from_slice(&v.timestamp().to_le_bytes());
        out[8..].copy_from_slice(&v.timestamp_subsec_nanos().to_le_bytes());
    };
    Duration => TimeSpan, 12, |v, out| {
        out[..8].copy_from_slice(&v.as_secs().to_le_bytes());
        out[8..].copy_from_slice(&v.subsec_nanos().to_le_bytes());
    };
}

impl<T: Encode> Encode for Option<T> {
    #[inline(always)]
    fn encode(self, message: &mut Message, format: Option<&'static str>) {
        match self {
            Some(value) => value.encode(message, format),
            None => message.write_null(),
        }
    }
}

/// A string kept by reference in a message's string table.
///
/// Neither variant copies the text: a static string is a plain reference
/// and a shared string only bumps a reference count.
#[derive(Debug, Clone)]
pub enum StrRef {
    Static(&'static str),
    Shared(Arc<str>),
}

impl StrRef {
    #[inline(always)]
    pub fn as_str(&self) -> &str {
        match self {
            StrRef::Static(s) => s,
            StrRef::Shared(s) => s,
        }
    }
}

impl From<&'static str> for StrRef {
    fn from(s: &'static str) -> Self {
        StrRef::Static(s)
    }
}

impl From<Arc<str>> for StrRef {
    fn from(s: Arc<str>) -> Self {
        StrRef::Shared(s)
    }
}

impl From<&Arc<str>> for StrRef {
    fn from(s: &Arc<str>) -> Self {
        StrRef::Shared(Arc::clone(s))
    }
}

/// Converts into a shared string. This allocates; prefer static strings or
/// an existing `Arc<str>` on hot paths.
impl From<String> for StrRef {
    fn from(s: String) -> Self {
        StrRef::Shared(Arc::from(s))
    }
}

impl Encode for StrRef {
    #[inline(always)]
    fn encode(self, message: &mut Message, format: Option<&'static str>) {
        message.write_string(self, format);
    }
}

impl Encode for &'static str {
    #[inline(always)]
    fn encode(self, message: &mut Message, format: Option<&'static str>) {
        message.write_string(StrRef::Static(self), format);
    }
}

impl Encode for Arc<str> {
    #[inline(always)]
    fn encode(self, message: &mut Message, format: Option<&'static str>) {
        message.write_string(StrRef::Shared(self), format);
    }
}

/// Wraps a [`LogEnum`] so it can go through the generic [`Encode`] paths
/// such as key/value pairs and `Option`.
#[derive(Debug, Clone, Copy)]
pub struct EnumArg<E>(pub E);

impl<E: LogEnum> Encode for EnumArg<E> {
    #[inline(always)]
    fn encode(self, message: &mut Message, format: Option<&'static str>) {
        message.write_enum(E::TYPE_ID, self.0.to_raw(), format);
    }
}

/// Fixed-point decimal: `mantissa × 10^-scale`.
///
/// Covers the range of a 128-bit integer with up to 28 fractional digits.
///
/// ```
/// # use pooled_logger::argument::Decimal;
/// assert_eq!(Decimal::new(-12345, 2).to_string(), "-123.45");
/// assert_eq!(Decimal::new(5, 3).to_string(), "0.005");
/// assert_eq!(format!("{:.1}", Decimal::new(12345, 2)), "123.5");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

impl Decimal {
    pub const MAX_SCALE: u8 = 28;

    pub const fn new(mantissa: i128, scale: u8) -> Self {
        let scale = if scale > Self::MAX_SCALE { Self::MAX_SCALE } else { scale };
        Self { mantissa, scale }
    }

    pub const fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub const fn scale(&self) -> u8 {
        self.scale
    }

    /// Returns the value with exactly `scale` fractional digits, rounding
    /// half away from zero when digits are removed.
    pub fn rescale(&self, scale: u8) -> Decimal {
        let scale = scale.min(Self::MAX_SCALE);
        if scale >= self.scale {
            let factor = 10i128.pow(u32::from(scale - self.scale));
            return Decimal::new(self.mantissa.saturating_mul(factor), scale);
        }
        let factor = 10i128.pow(u32::from(self.scale - scale));
        let quotient = self.mantissa / factor;
        let remainder = (self.mantissa % factor).abs();
        let rounded = if remainder * 2 >= factor {
            quotient + self.mantissa.signum()
        } else {
            quotient
        };
        Decimal::new(rounded, scale)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match f.precision() {
            Some(p) => self.rescale(p.min(usize::from(Self::MAX_SCALE)) as u8),
            None => *self,
        };

        if value.mantissa < 0 {
            f.write_str("-")?;
        }
        let abs = value.mantissa.unsigned_abs();
        if value.scale == 0 {
            return write!(f, "{}", abs);
        }
        let factor = 10u128.pow(u32::from(value.scale));
        write!(
            f,
            "{}.{:0width$}",
            abs / factor,
            abs % factor,
            width = usize::from(value.scale)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_round_trip() {
        for tag in 0..=u8::MAX {
            if let Some(kind) = ArgumentType::from_u8(tag) {
                assert_eq!(kind as u8, tag);
                assert_eq!(tag & FORMAT_FLAG, 0);
            }
        }
    }

    #[test]
    fn test_decimal_display() {
        assert_eq!(Decimal::new(0, 0).to_string(), "0");
        assert_eq!(Decimal::new(100, 2).to_string(), "1.00");
        assert_eq!(Decimal::new(-5, 1).to_string(), "-0.5");
        assert_eq!(Decimal::new(i128::MAX, 0).to_string(), i128::MAX.to_string());
    }

    #[test]
    fn test_decimal_rescale_rounds_half_away_from_zero() {
        assert_eq!(Decimal::new(125, 2).rescale(1), Decimal::new(13, 1));
        assert_eq!(Decimal::new(-125, 2).rescale(1), Decimal::new(-13, 1));
        assert_eq!(Decimal::new(124, 2).rescale(1), Decimal::new(12, 1));
        assert_eq!(Decimal::new(12, 1).rescale(3), Decimal::new(1200, 3));
    }

    #[test]
    fn test_scale_is_clamped() {
        assert_eq!(Decimal::new(1, 200).scale(), Decimal::MAX_SCALE);
    }

    #[test]
    fn test_primitive_layouts() {
        let mut out = [0u8; 12];
        Duration::new(3, 7).write_to(&mut out);
        assert_eq!(u64::from_le_bytes(out[..8].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(out[8..].try_into().unwrap()), 7);

        let mut out = [0u8; 4];
        'é'.write_to(&mut out);
        assert_eq!(u32::from_le_bytes(out), 'é' as u32);
    }
}
