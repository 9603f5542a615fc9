//! Reader for message buffers.
//!
//! Walks the byte stream written by [`Message`] front to back, once, and
//! yields one [`Token`] per encoded value. The walk ends at the end of the
//! written bytes or right after a truncation marker. Decoding needs nothing
//! but the buffer and the message's string table: enum and struct values are
//! returned as raw `(type id, data)` and left to the renderer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::argument::{ArgumentType, Decimal, StrRef, FORMAT_FLAG};
use crate::message::Message;

/// A decoded value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue<'a> {
    Null,
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Usize(usize),
    Isize(isize),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Char(char),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
    TimeSpan(Duration),
    Str(&'a str),
    Enum { type_id: u32, raw: u64 },
    Unmanaged { type_id: u32, bytes: &'a [u8] },
}

/// A value and the format specifier captured with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Argument<'a> {
    pub value: ArgValue<'a>,
    pub format: Option<&'a str>,
}

/// One item of a message buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'a> {
    /// A `{0}`-style template the following arguments fill in.
    Template(&'a str),
    Arg(Argument<'a>),
    KeyValue { key: &'a str, value: Argument<'a> },
    /// The encoder ran out of space here; nothing follows.
    Truncated,
}

/// Errors raised by malformed buffers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown discriminant {tag:#04x} at offset {offset}")]
    UnknownDiscriminant { tag: u8, offset: usize },

    #[error("buffer ends at offset {offset}, {needed} more bytes expected")]
    UnexpectedEnd { offset: usize, needed: usize },

    #[error("string index {index} out of range, table holds {count}")]
    StringIndex { index: u16, count: usize },

    #[error("invalid char code point {0:#x}")]
    InvalidChar(u32),

    #[error("invalid UTF-8 in inline string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("date/time out of range")]
    InvalidDateTime,

    #[error("discriminant {tag:#04x} not allowed at offset {offset}")]
    Misplaced { tag: u8, offset: usize },
}

/// Forward-only iterator over the tokens of one message buffer.
///
/// After the first error or a [`Token::Truncated`] the iterator is
/// exhausted.
///
/// # Examples
///
/// ```
/// # use pooled_logger::message::Message;
/// # use pooled_logger::level::Level;
/// # use pooled_logger::decoder::{ArgumentReader, ArgValue, Token};
/// let mut message = Message::standalone(64, 4);
/// message.reset(Level::Info, None);
/// message.append("Count ").append(42i32);
///
/// let values: Vec<_> = ArgumentReader::for_message(&message)
///     .map(|token| token.unwrap())
///     .collect();
/// assert!(matches!(values[0], Token::Arg(arg) if arg.value == ArgValue::Str("Count ")));
/// assert!(matches!(values[1], Token::Arg(arg) if arg.value == ArgValue::I32(42)));
/// ```
pub struct ArgumentReader<'a> {
    data: &'a [u8],
    strings: &'a [StrRef],
    pos: usize,
    done: bool,
}

impl<'a> ArgumentReader<'a> {
    pub fn new(data: &'a [u8], strings: &'a [StrRef]) -> Self {
        Self {
            data,
            strings,
            pos: 0,
            done: false,
        }
    }

    pub fn for_message(message: &'a Message) -> Self {
        Self::new(message.encoded(), message.strings())
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(DecodeError::UnexpectedEnd {
                offset: self.pos,
                needed: end - self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.take_array().map(u16::from_le_bytes)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.take_array().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.take_array().map(u64::from_le_bytes)
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.take_array().map(i64::from_le_bytes)
    }

    fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let index = self.read_u16()?;
        self.strings
            .get(usize::from(index))
            .map(StrRef::as_str)
            .ok_or(DecodeError::StringIndex {
                index,
                count: self.strings.len(),
            })
    }

    fn read_value(&mut self, kind: ArgumentType, offset: usize) -> Result<ArgValue<'a>, DecodeError> {
        use ArgumentType as T;
        Ok(match kind {
            T::Null => ArgValue::Null,
            T::Bool => ArgValue::Bool(self.read_u8()? != 0),
            T::U8 => ArgValue::U8(self.read_u8()?),
            T::I8 => ArgValue::I8(self.read_u8()? as i8),
            T::U16 => ArgValue::U16(self.read_u16()?),
            T::I16 => ArgValue::I16(self.take_array().map(i16::from_le_bytes)?),
            T::U32 => ArgValue::U32(self.read_u32()?),
            T::I32 => ArgValue::I32(self.take_array().map(i32::from_le_bytes)?),
            T::U64 => ArgValue::U64(self.read_u64()?),
            T::I64 => ArgValue::I64(self.read_i64()?),
            T::Usize => ArgValue::Usize(self.read_u64()? as usize),
            T::Isize => ArgValue::Isize(self.read_i64()? as isize),
            T::F32 => ArgValue::F32(self.take_array().map(f32::from_le_bytes)?),
            T::F64 => ArgValue::F64(self.take_array().map(f64::from_le_bytes)?),
            T::Decimal => {
                let mantissa = self.take_array().map(i128::from_le_bytes)?;
                let scale = self.read_u8()?;
                ArgValue::Decimal(Decimal::new(mantissa, scale))
            }
            T::Char => {
                let code = self.read_u32()?;
                ArgValue::Char(char::from_u32(code).ok_or(DecodeError::InvalidChar(code))?)
            }
            T::Guid => ArgValue::Guid(Uuid::from_bytes(self.take_array()?)),
            T::DateTime => {
                let secs = self.read_i64()?;
                let nanos = self.read_u32()?;
                let value = DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(DecodeError::InvalidDateTime)?;
                ArgValue::DateTime(value)
            }
            T::TimeSpan => {
                let secs = self.read_u64()?;
                let nanos = self.read_u32()?;
                ArgValue::TimeSpan(Duration::new(secs, nanos))
            }
            T::String => ArgValue::Str(self.read_string()?),
            T::InlineString => {
                let len = usize::from(self.read_u16()?);
                let start = self.pos;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset: start })?;
                ArgValue::Str(text)
            }
            T::Enum => {
                let type_id = self.read_u32()?;
                let raw = self.read_u64()?;
                ArgValue::Enum { type_id, raw }
            }
            T::Unmanaged => {
                let type_id = self.read_u32()?;
                let len = usize::from(self.read_u16()?);
                let bytes = self.take(len)?;
                ArgValue::Unmanaged { type_id, bytes }
            }
            T::FormatString | T::KeyString | T::EndOfTruncatedMessage => {
                return Err(DecodeError::Misplaced {
                    tag: kind as u8,
                    offset,
                })
            }
        })
    }

    fn read_argument(&mut self, tag: u8, offset: usize) -> Result<Argument<'a>, DecodeError> {
        let kind = ArgumentType::from_u8(tag & !FORMAT_FLAG)
            .ok_or(DecodeError::UnknownDiscriminant { tag, offset })?;
        if kind == ArgumentType::Null && tag & FORMAT_FLAG != 0 {
            return Err(DecodeError::Misplaced { tag, offset });
        }
        let value = self.read_value(kind, offset)?;
        let format = if tag & FORMAT_FLAG != 0 {
            Some(self.read_string()?)
        } else {
            None
        };
        Ok(Argument { value, format })
    }

    fn read_token(&mut self) -> Result<Option<Token<'a>>, DecodeError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        let token = match ArgumentType::from_u8(tag) {
            Some(ArgumentType::EndOfTruncatedMessage) => {
                self.done = true;
                Token::Truncated
            }
            Some(ArgumentType::FormatString) => Token::Template(self.read_string()?),
            Some(ArgumentType::KeyString) => {
                let key = self.read_string()?;
                if self.pos >= self.data.len() {
                    return Err(DecodeError::UnexpectedEnd {
                        offset: self.pos,
                        needed: 1,
                    });
                }
                let value_offset = self.pos;
                let value_tag = self.read_u8()?;
                if value_tag == ArgumentType::EndOfTruncatedMessage as u8 {
                    self.done = true;
                    return Ok(Some(Token::Truncated));
                }
                let value = self.read_argument(value_tag, value_offset)?;
                Token::KeyValue { key, value }
            }
            _ => Token::Arg(self.read_argument(tag, offset)?),
        };
        Ok(Some(token))
    }
}

impl<'a> Iterator for ArgumentReader<'a> {
    type Item = Result<Token<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        match self.read_token() {
            Ok(token) => token.map(Ok),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl std::iter::FusedIterator for ArgumentReader<'_> {}
