//! Runtime format specifiers.
//!
//! `append_formatted` stores a specifier string next to a value. On the
//! dispatcher side the string is parsed into a [`FormatSpec`] and applied the
//! way `format!` would apply the same spec written inline, so
//! `append_formatted(255u32, "#06x")` renders exactly like
//! `format!("{:#06x}", 255u32)`.
//!
//! Supported grammar: `[<^>][+][#][0][width][.precision][type]` where `type`
//! is one of `x X o b e E ?` or empty. Custom fill characters and
//! argument-supplied widths are not supported. Width and precision are
//! capped at [`MAX_WIDTH`].

use std::fmt::{self, Binary, Debug, Display, LowerExp, LowerHex, Octal, UpperExp, UpperHex, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    Display,
    Debug,
    LowerHex,
    UpperHex,
    Octal,
    Binary,
    LowerExp,
    UpperExp,
}

/// A parsed format specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatSpec {
    pub align: Option<Align>,
    pub sign_plus: bool,
    pub alternate: bool,
    pub zero_pad: bool,
    pub width: usize,
    pub precision: Option<usize>,
    pub kind: Kind,
}

impl FormatSpec {
    /// Parses a specifier. Returns `None` if the text does not follow the
    /// supported grammar.
    ///
    /// ```
    /// # use pooled_logger::format_spec::{FormatSpec, Kind};
    /// let spec = FormatSpec::parse("#010x").unwrap();
    /// assert!(spec.alternate && spec.zero_pad);
    /// assert_eq!(spec.width, 10);
    /// assert_eq!(spec.kind, Kind::LowerHex);
    /// assert!(FormatSpec::parse("%Y-%m").is_none());
    /// ```
    pub fn parse(spec: &str) -> Option<FormatSpec> {
        let bytes = spec.as_bytes();
        let mut pos = 0;
        let mut parsed = FormatSpec::default();

        parsed.align = match bytes.first() {
            Some(b'<') => Some(Align::Left),
            Some(b'^') => Some(Align::Center),
            Some(b'>') => Some(Align::Right),
            _ => None,
        };
        if parsed.align.is_some() {
            pos += 1;
        }
        if bytes.get(pos) == Some(&b'+') {
            parsed.sign_plus = true;
            pos += 1;
        }
        if bytes.get(pos) == Some(&b'#') {
            parsed.alternate = true;
            pos += 1;
        }
        if bytes.get(pos) == Some(&b'0') {
            parsed.zero_pad = true;
            pos += 1;
        }

        let (width, next) = parse_number(bytes, pos);
        parsed.width = width.unwrap_or(0);
        pos = next;

        if bytes.get(pos) == Some(&b'.') {
            let (precision, next) = parse_number(bytes, pos + 1);
            parsed.precision = Some(precision?);
            pos = next;
        }

        parsed.kind = match bytes.get(pos) {
            None => return Some(parsed),
            Some(b'x') => Kind::LowerHex,
            Some(b'X') => Kind::UpperHex,
            Some(b'o') => Kind::Octal,
            Some(b'b') => Kind::Binary,
            Some(b'e') => Kind::LowerExp,
            Some(b'E') => Kind::UpperExp,
            Some(b'?') => Kind::Debug,
            Some(_) => return None,
        };

        (pos + 1 == bytes.len()).then_some(parsed)
    }
}

/// Largest width or precision a specifier can ask for. Larger values are
/// clamped.
pub const MAX_WIDTH: usize = 1024;

fn parse_number(bytes: &[u8], start: usize) -> (Option<usize>, usize) {
    let mut pos = start;
    let mut value: Option<usize> = None;
    while let Some(digit) = bytes.get(pos).filter(|b| b.is_ascii_digit()) {
        let current = value.unwrap_or(0);
        value = Some(current.saturating_mul(10).saturating_add(usize::from(digit - b'0')).min(MAX_WIDTH));
        pos += 1;
    }
    (value, pos)
}

/// Integer types accepted by [`write_integer`].
pub trait IntegerFormat:
    Display + Debug + LowerHex + UpperHex + Octal + Binary + LowerExp + UpperExp + Copy
{
}

impl<T> IntegerFormat for T where
    T: Display + Debug + LowerHex + UpperHex + Octal + Binary + LowerExp + UpperExp + Copy
{
}

/// Writes an integer the way `format!` would with `spec`.
pub fn write_integer<T: IntegerFormat>(out: &mut String, value: T, spec: &FormatSpec) -> fmt::Result {
    let start = out.len();
    let alt = spec.alternate;
    match (spec.kind, spec.precision) {
        (Kind::Display, _) => write!(out, "{}", value),
        (Kind::Debug, _) => write!(out, "{:?}", value),
        (Kind::LowerHex, _) if alt => write!(out, "{:#x}", value),
        (Kind::LowerHex, _) => write!(out, "{:x}", value),
        (Kind::UpperHex, _) if alt => write!(out, "{:#X}", value),
        (Kind::UpperHex, _) => write!(out, "{:X}", value),
        (Kind::Octal, _) if alt => write!(out, "{:#o}", value),
        (Kind::Octal, _) => write!(out, "{:o}", value),
        (Kind::Binary, _) if alt => write!(out, "{:#b}", value),
        (Kind::Binary, _) => write!(out, "{:b}", value),
        (Kind::LowerExp, Some(p)) => write!(out, "{:.*e}", p, value),
        (Kind::LowerExp, None) => write!(out, "{:e}", value),
        (Kind::UpperExp, Some(p)) => write!(out, "{:.*E}", p, value),
        (Kind::UpperExp, None) => write!(out, "{:E}", value),
    }?;
    finish_numeric(out, start, spec);
    Ok(())
}

/// Writes a float the way `format!` would with `spec`. Radix kinds are not
/// defined for floats and fall back to plain display.
pub fn write_float<T>(out: &mut String, value: T, spec: &FormatSpec) -> fmt::Result
where
    T: Display + Debug + LowerExp + UpperExp + Copy,
{
    let start = out.len();
    match (spec.kind, spec.precision) {
        (Kind::Debug, Some(p)) => write!(out, "{:.*?}", p, value),
        (Kind::Debug, None) => write!(out, "{:?}", value),
        (Kind::LowerExp, Some(p)) => write!(out, "{:.*e}", p, value),
        (Kind::LowerExp, None) => write!(out, "{:e}", value),
        (Kind::UpperExp, Some(p)) => write!(out, "{:.*E}", p, value),
        (Kind::UpperExp, None) => write!(out, "{:E}", value),
        (_, Some(p)) => write!(out, "{:.*}", p, value),
        (_, None) => write!(out, "{}", value),
    }?;
    finish_numeric(out, start, spec);
    Ok(())
}

/// Writes any other numeric `Display` value (decimals) honoring precision,
/// sign and zero padding.
pub fn write_numeric_display<T: Display>(out: &mut String, value: &T, spec: &FormatSpec) -> fmt::Result {
    let start = out.len();
    match spec.precision {
        Some(p) => write!(out, "{:.*}", p, value),
        None => write!(out, "{}", value),
    }?;
    finish_numeric(out, start, spec);
    Ok(())
}

/// Writes a non-numeric value. Precision truncates to that many characters,
/// as it does for strings in `format!`; padding defaults to the left.
pub fn write_text<T: Display + ?Sized>(out: &mut String, value: &T, spec: &FormatSpec) -> fmt::Result {
    let start = out.len();
    write!(out, "{}", value)?;
    if let Some(p) = spec.precision {
        if let Some((idx, _)) = out[start..].char_indices().nth(p) {
            out.truncate(start + idx);
        }
    }
    pad(out, start, spec.width, spec.align.unwrap_or(Align::Left));
    Ok(())
}

/// Pads everything written to `out` since `start` to the spec's width.
/// Used for values that do their own formatting.
pub fn pad_written(out: &mut String, start: usize, spec: &FormatSpec, default_align: Align) {
    pad(out, start, spec.width, spec.align.unwrap_or(default_align));
}

fn finish_numeric(out: &mut String, start: usize, spec: &FormatSpec) {
    if spec.sign_plus && !out[start..].starts_with('-') && !out[start..].starts_with("NaN") {
        out.insert(start, '+');
    }

    let len = out[start..].chars().count();
    if spec.width <= len {
        return;
    }

    if spec.zero_pad {
        let mut insert_at = start;
        if out[start..].starts_with(['+', '-']) {
            insert_at += 1;
        }
        let rest = &out[insert_at..];
        if spec.alternate && (rest.starts_with("0x") || rest.starts_with("0o") || rest.starts_with("0b")) {
            insert_at += 2;
        }
        out.insert_str(insert_at, &"0".repeat(spec.width - len));
    } else {
        pad(out, start, spec.width, spec.align.unwrap_or(Align::Right));
    }
}

fn pad(out: &mut String, start: usize, width: usize, align: Align) {
    let len = out[start..].chars().count();
    if width <= len {
        return;
    }
    let fill = width - len;
    let (before, after) = match align {
        Align::Left => (0, fill),
        Align::Right => (fill, 0),
        Align::Center => (fill / 2, fill - fill / 2),
    };
    out.insert_str(start, &" ".repeat(before));
    out.extend(std::iter::repeat(' ').take(after));
}
