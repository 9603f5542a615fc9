use std::fmt::{self, Display, Write};
use std::ops::Range;
use std::sync::Arc;
use std::thread::ThreadId;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::decoder::{ArgValue, Argument, ArgumentReader, DecodeError, Token};
use crate::format_spec::{
    pad_written, write_float, write_integer, write_numeric_display, write_text, Align, FormatSpec, IntegerFormat,
};
use crate::level::Level;
use crate::message::{Message, SharedError};
use crate::type_registry::TypeLookup;

pub const DEFAULT_NULL_DISPLAY: &str = "null";
pub const DEFAULT_TRUNCATED_SUFFIX: &str = " [TRUNCATED]";

const DATETIME_DEFAULT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
const LINE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A decoded event as sinks see it.
///
/// The text and key/value strings live in buffers owned by the
/// [`Renderer`] and are reused from one message to the next, so a sink
/// must copy whatever it wants to keep.
pub struct RenderedMessage {
    level: Level,
    timestamp: DateTime<Utc>,
    thread: ThreadId,
    logger: Option<Arc<str>>,
    text: String,
    pairs: String,
    pair_ranges: Vec<(Range<usize>, Range<usize>)>,
    error: Option<SharedError>,
    truncated: bool,
    decode_error: Option<DecodeError>,
}

impl RenderedMessage {
    fn empty() -> Self {
        Self {
            level: Level::Info,
            timestamp: Utc::now(),
            thread: std::thread::current().id(),
            logger: None,
            text: String::with_capacity(256),
            pairs: String::new(),
            pair_ranges: Vec::new(),
            error: None,
            truncated: false,
            decode_error: None,
        }
    }

    fn start(&mut self, message: &Message) {
        self.level = message.level();
        self.timestamp = message.timestamp();
        self.thread = message.thread_id();
        self.logger = message.logger_arc().cloned();
        self.text.clear();
        self.pairs.clear();
        self.pair_ranges.clear();
        self.error = message.error().cloned();
        self.truncated = false;
        self.decode_error = None;
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Name of the logger the event was recorded through; empty for the
    /// root logger.
    pub fn logger_name(&self) -> &str {
        self.logger.as_deref().unwrap_or("")
    }

    /// The message text, with the truncation suffix if the buffer overflowed.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Structured pairs in the order they were appended.
    pub fn key_values(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.pair_ranges
            .iter()
            .map(|(key, value)| (&self.pairs[key.clone()], &self.pairs[value.clone()]))
    }

    pub fn error(&self) -> Option<&SharedError> {
        self.error.as_ref()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Set when the buffer was malformed. The text then holds what was
    /// decoded before the fault plus a description of it.
    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.decode_error.as_ref()
    }

    /// Writes the default single-line form, without a trailing newline:
    ///
    /// ```text
    /// 2024-01-02 03:04:05.123456 [INFO ] orders.api: Count 42 user=7 boom
    /// ```
    pub fn write_line<W: Write + ?Sized>(&self, out: &mut W) -> fmt::Result {
        write!(
            out,
            "{} [{}] ",
            self.timestamp.format(LINE_TIMESTAMP),
            self.level.padded_name()
        )?;
        if let Some(logger) = self.logger.as_deref().filter(|name| !name.is_empty()) {
            write!(out, "{}: ", logger)?;
        }
        out.write_str(&self.text)?;
        for (key, value) in self.key_values() {
            write!(out, " {}={}", key, value)?;
        }
        if let Some(error) = &self.error {
            write!(out, " {}", error)?;
        }
        Ok(())
    }

    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(self.text.len() + 48);
        // Writing into a String cannot fail.
        let _ = self.write_line(&mut line);
        line
    }
}

impl fmt::Debug for RenderedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedMessage")
            .field("level", &self.level)
            .field("logger", &self.logger_name())
            .field("text", &self.text)
            .field("truncated", &self.truncated)
            .finish_non_exhaustive()
    }
}

/// Turns message buffers into text.
///
/// One renderer lives on the dispatcher thread and is reused for every
/// message. Arguments are written one after another unless a template was
/// captured with [`Message::append_template`], in which case the arguments
/// following it fill its `{0}`, `{1}`, … placeholders. `{{` and `}}` stand
/// for literal braces; placeholders without a matching argument are kept
/// as written.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use pooled_logger::message::Message;
/// # use pooled_logger::level::Level;
/// # use pooled_logger::render::Renderer;
/// # use pooled_logger::type_registry::TypeRegistry;
/// let mut renderer = Renderer::new(Arc::new(TypeRegistry::new()));
/// let mut message = Message::standalone(128, 8);
/// message.reset(Level::Info, None);
/// message
///     .append_template("{1} of {0} done")
///     .append(10u32)
///     .append_formatted(7.26f64, ".1");
///
/// assert_eq!(renderer.render(&message).text(), "7.3 of 10 done");
/// ```
pub struct Renderer {
    types: Arc<dyn TypeLookup>,
    null_display: String,
    truncated_suffix: String,
    args: String,
    arg_ranges: Vec<Range<usize>>,
    rendered: RenderedMessage,
}

impl Renderer {
    pub fn new(types: Arc<dyn TypeLookup>) -> Self {
        Self {
            types,
            null_display: DEFAULT_NULL_DISPLAY.to_string(),
            truncated_suffix: DEFAULT_TRUNCATED_SUFFIX.to_string(),
            args: String::with_capacity(256),
            arg_ranges: Vec::with_capacity(16),
            rendered: RenderedMessage::empty(),
        }
    }

    pub fn with_null_display(mut self, text: impl Into<String>) -> Self {
        self.null_display = text.into();
        self
    }

    pub fn with_truncated_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.truncated_suffix = suffix.into();
        self
    }

    /// The result of the latest [`render`](Self::render) call.
    pub fn last(&self) -> &RenderedMessage {
        &self.rendered
    }

    /// Decodes and renders `message`. Malformed buffers do not fail: the
    /// result carries the decode error instead.
    pub fn render(&mut self, message: &Message) -> &RenderedMessage {
        let Renderer {
            types,
            null_display,
            truncated_suffix,
            args,
            arg_ranges,
            rendered,
        } = self;
        let values = ValueWriter {
            types: &**types,
            null_display: null_display.as_str(),
        };

        rendered.start(message);
        args.clear();
        arg_ranges.clear();

        let mut template = None;
        for token in ArgumentReader::for_message(message) {
            match token {
                Ok(Token::Template(next)) => {
                    write_segment(&mut rendered.text, template, args, arg_ranges);
                    args.clear();
                    arg_ranges.clear();
                    template = Some(next);
                }
                Ok(Token::Arg(arg)) => {
                    let start = args.len();
                    values.write(args, &arg);
                    arg_ranges.push(start..args.len());
                }
                Ok(Token::KeyValue { key, value }) => {
                    let key_start = rendered.pairs.len();
                    rendered.pairs.push_str(key);
                    let value_start = rendered.pairs.len();
                    values.write(&mut rendered.pairs, &value);
                    let end = rendered.pairs.len();
                    rendered.pair_ranges.push((key_start..value_start, value_start..end));
                }
                Ok(Token::Truncated) => rendered.truncated = true,
                Err(err) => {
                    rendered.decode_error = Some(err);
                    break;
                }
            }
        }
        write_segment(&mut rendered.text, template, args, arg_ranges);

        if rendered.truncated {
            rendered.text.push_str(truncated_suffix);
        }
        if let Some(err) = &rendered.decode_error {
            let _ = write!(rendered.text, " [undecodable message: {}]", err);
        }
        &*rendered
    }

    /// Renders `message` without type lookups, format specifiers or
    /// template substitution, then appends `[render panicked: reason]`.
    /// Used when [`render`](Self::render) panicked on the same message.
    pub fn render_fallback(&mut self, message: &Message, reason: &str) -> &RenderedMessage {
        let rendered = &mut self.rendered;
        rendered.start(message);

        for token in ArgumentReader::for_message(message) {
            match token {
                Ok(Token::Template(_)) => {}
                Ok(Token::Arg(arg)) => write_raw(&mut rendered.text, &arg.value, &self.null_display),
                Ok(Token::KeyValue { key, value }) => {
                    let key_start = rendered.pairs.len();
                    rendered.pairs.push_str(key);
                    let value_start = rendered.pairs.len();
                    write_raw(&mut rendered.pairs, &value.value, &self.null_display);
                    let end = rendered.pairs.len();
                    rendered.pair_ranges.push((key_start..value_start, value_start..end));
                }
                Ok(Token::Truncated) => rendered.truncated = true,
                Err(err) => {
                    rendered.decode_error = Some(err);
                    break;
                }
            }
        }

        if rendered.truncated {
            rendered.text.push_str(&self.truncated_suffix);
        }
        let _ = write!(rendered.text, " [render panicked: {}]", reason);
        &*rendered
    }
}

/// Plain rendering of a decoded value. Never calls user code.
fn write_raw(out: &mut String, value: &ArgValue<'_>, null_display: &str) {
    let _ = match *value {
        ArgValue::Null => out.write_str(null_display),
        ArgValue::Bool(v) => write!(out, "{}", v),
        ArgValue::U8(v) => write!(out, "{}", v),
        ArgValue::I8(v) => write!(out, "{}", v),
        ArgValue::U16(v) => write!(out, "{}", v),
        ArgValue::I16(v) => write!(out, "{}", v),
        ArgValue::U32(v) => write!(out, "{}", v),
        ArgValue::I32(v) => write!(out, "{}", v),
        ArgValue::U64(v) => write!(out, "{}", v),
        ArgValue::I64(v) => write!(out, "{}", v),
        ArgValue::Usize(v) => write!(out, "{}", v),
        ArgValue::Isize(v) => write!(out, "{}", v),
        ArgValue::F32(v) => write!(out, "{}", v),
        ArgValue::F64(v) => write!(out, "{}", v),
        ArgValue::Decimal(v) => write!(out, "{}", v),
        ArgValue::Char(v) => out.write_char(v),
        ArgValue::Guid(v) => write!(out, "{}", v.hyphenated()),
        ArgValue::DateTime(v) => write!(out, "{}", v.format(DATETIME_DEFAULT)),
        ArgValue::TimeSpan(v) => write!(out, "{:?}", v),
        ArgValue::Str(v) => out.write_str(v),
        ArgValue::Enum { raw, .. } => write!(out, "{}", raw),
        ArgValue::Unmanaged { type_id, .. } => write!(out, "Unmanaged(0x{:08x})", type_id),
    };
}

fn write_segment(out: &mut String, template: Option<&str>, args: &str, ranges: &[Range<usize>]) {
    match template {
        None => out.push_str(args),
        Some(template) => substitute(out, template, args, ranges),
    }
}

fn substitute(out: &mut String, template: &str, args: &str, ranges: &[Range<usize>]) {
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if let Some((range, len)) = placeholder(tail).and_then(|(index, len)| Some((ranges.get(index)?, len))) {
            out.push_str(&args[range.clone()]);
            rest = &tail[len..];
            continue;
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
}

/// Parses `{N}` at the start of `text` into the index and the length of
/// the placeholder.
fn placeholder(text: &str) -> Option<(usize, usize)> {
    let inner = text.strip_prefix('{')?;
    let close = inner.find('}')?;
    let digits = &inner[..close];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, close + 2))
}

struct ValueWriter<'r> {
    types: &'r dyn TypeLookup,
    null_display: &'r str,
}

impl ValueWriter<'_> {
    fn write(&self, out: &mut String, arg: &Argument<'_>) {
        let start = out.len();
        if self.try_write(out, arg).is_ok() {
            return;
        }
        out.truncate(start);
        let plain = Argument {
            value: arg.value,
            format: None,
        };
        if let ArgValue::Unmanaged { type_id, .. } = arg.value {
            let _ = write!(out, "Unmanaged(0x{:08x})", type_id);
        } else if self.try_write(out, &plain).is_err() {
            out.truncate(start);
        }
    }

    fn try_write(&self, out: &mut String, arg: &Argument<'_>) -> fmt::Result {
        let spec = arg.format.and_then(FormatSpec::parse);
        match arg.value {
            ArgValue::Null => {
                out.push_str(self.null_display);
                Ok(())
            }
            ArgValue::Bool(v) => text(out, &v, spec),
            ArgValue::U8(v) => integer(out, v, spec),
            ArgValue::I8(v) => integer(out, v, spec),
            ArgValue::U16(v) => integer(out, v, spec),
            ArgValue::I16(v) => integer(out, v, spec),
            ArgValue::U32(v) => integer(out, v, spec),
            ArgValue::I32(v) => integer(out, v, spec),
            ArgValue::U64(v) => integer(out, v, spec),
            ArgValue::I64(v) => integer(out, v, spec),
            ArgValue::Usize(v) => integer(out, v, spec),
            ArgValue::Isize(v) => integer(out, v, spec),
            ArgValue::F32(v) => match spec {
                Some(spec) => write_float(out, v, &spec),
                None => write!(out, "{}", v),
            },
            ArgValue::F64(v) => match spec {
                Some(spec) => write_float(out, v, &spec),
                None => write!(out, "{}", v),
            },
            ArgValue::Decimal(v) => match spec {
                Some(spec) => write_numeric_display(out, &v, &spec),
                None => write!(out, "{}", v),
            },
            ArgValue::Char(v) => text(out, &v, spec),
            ArgValue::Guid(v) => guid(out, v, arg.format),
            ArgValue::DateTime(v) => datetime(out, v, arg.format),
            ArgValue::TimeSpan(v) => {
                let start = out.len();
                match spec.and_then(|spec| spec.precision) {
                    Some(p) => write!(out, "{:.*?}", p, v)?,
                    None => write!(out, "{:?}", v)?,
                }
                if let Some(spec) = spec {
                    pad_written(out, start, &spec, Align::Right);
                }
                Ok(())
            }
            ArgValue::Str(v) => text(out, v, spec),
            ArgValue::Enum { type_id, raw } => {
                match self.types.lookup_enum_renderer(type_id).and_then(|name_of| name_of(raw)) {
                    Some(name) => text(out, name, spec),
                    None => integer(out, raw, spec),
                }
            }
            ArgValue::Unmanaged { type_id, bytes } => match self.types.lookup_struct_renderer(type_id) {
                Some(render) => render(bytes, out, arg.format),
                None => write!(out, "Unmanaged(0x{:08x})", type_id),
            },
        }
    }
}

fn integer<T: IntegerFormat>(out: &mut String, value: T, spec: Option<FormatSpec>) -> fmt::Result {
    match spec {
        Some(spec) => write_integer(out, value, &spec),
        None => write!(out, "{}", value),
    }
}

fn text<T: Display + ?Sized>(out: &mut String, value: &T, spec: Option<FormatSpec>) -> fmt::Result {
    match spec {
        Some(spec) => write_text(out, value, &spec),
        None => write!(out, "{}", value),
    }
}

fn guid(out: &mut String, value: Uuid, format: Option<&str>) -> fmt::Result {
    match format {
        Some("simple") => write!(out, "{}", value.simple()),
        Some("urn") => write!(out, "{}", value.urn()),
        Some("braced") => write!(out, "{}", value.braced()),
        _ => write!(out, "{}", value.hyphenated()),
    }
}

fn datetime(out: &mut String, value: DateTime<Utc>, format: Option<&str>) -> fmt::Result {
    let items = StrftimeItems::new(format.unwrap_or(DATETIME_DEFAULT));
    if items.clone().any(|item| matches!(item, Item::Error)) {
        return Err(fmt::Error);
    }
    write!(out, "{}", value.format_with_items(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_registry::{LogEnum, TypeRegistry, UnmanagedStruct};
    use bytemuck::{Pod, Zeroable};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Side {
        Buy,
        Sell,
    }

    impl LogEnum for Side {
        const TYPE_ID: u32 = 0x51DE;
        fn to_raw(self) -> u64 {
            self as u64
        }
        fn name_of(raw: u64) -> Option<&'static str> {
            match raw {
                0 => Some("Buy"),
                1 => Some("Sell"),
                _ => None,
            }
        }
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Px {
        price: u32,
        qty: u32,
    }

    impl UnmanagedStruct for Px {
        const TYPE_ID: u32 = 0xBEEF;
        fn render(&self, out: &mut dyn fmt::Write, _format: Option<&str>) -> fmt::Result {
            write!(out, "{}@{}", self.qty, self.price)
        }
    }

    fn renderer() -> Renderer {
        let registry = TypeRegistry::new();
        registry.register_enum::<Side>().unwrap();
        Renderer::new(Arc::new(registry))
    }

    fn message() -> Message {
        let mut message = Message::standalone(256, 8);
        message.reset(Level::Info, None);
        message
    }

    #[test]
    fn test_concatenates_without_template() {
        let mut m = message();
        m.append("Count ").append(42i32);
        assert_eq!(renderer().render(&m).text(), "Count 42");
    }

    #[test]
    fn test_format_specifiers_match_std() {
        let mut m = message();
        m.append_formatted(255u8, "#06x")
            .append(" ")
            .append_formatted(3.14159f64, "8.3")
            .append(" ")
            .append_formatted("ab", ">4");
        let expected = format!("{:#06x} {:8.3} {:>4}", 255u8, 3.14159f64, "ab");
        assert_eq!(renderer().render(&m).text(), expected);
    }

    #[test]
    fn test_null_uses_configured_text() {
        let mut m = message();
        m.append(None::<u32>);
        let mut renderer = renderer().with_null_display("<none>");
        assert_eq!(renderer.render(&m).text(), "<none>");
    }

    #[test]
    fn test_enum_names_and_fallbacks() {
        let mut m = message();
        m.append_enum(Side::Sell).append(" ").append_enum(Side::Buy);
        assert_eq!(renderer().render(&m).text(), "Sell Buy");

        let mut m = message();
        m.append(crate::argument::EnumArg(Side::Sell));
        let mut bare = Renderer::new(Arc::new(TypeRegistry::new()));
        assert_eq!(bare.render(&m).text(), "1");
    }

    #[test]
    fn test_unregistered_struct_fallback() {
        let mut m = message();
        m.append_unmanaged(&Px { price: 10, qty: 3 });
        assert_eq!(renderer().render(&m).text(), "Unmanaged(0x0000beef)");

        let registry = TypeRegistry::new();
        registry.register_struct::<Px>().unwrap();
        let mut renderer = Renderer::new(Arc::new(registry));
        assert_eq!(renderer.render(&m).text(), "3@10");
    }

    #[test]
    fn test_template_placeholders() {
        let mut m = message();
        m.append_template("{{{0}}} {1} {0} {5}").append(1u8).append("x");
        assert_eq!(renderer().render(&m).text(), "{1} x 1 {5}");
    }

    #[test]
    fn test_key_values_go_to_separate_channel() {
        let mut m = message();
        m.append("done").append_key_value("user", 7u32).append_key_value("side", crate::argument::EnumArg(Side::Buy));
        let mut renderer = renderer();
        let rendered = renderer.render(&m);
        assert_eq!(rendered.text(), "done");
        let pairs: Vec<_> = rendered.key_values().collect();
        assert_eq!(pairs, vec![("user", "7"), ("side", "Buy")]);
    }

    #[test]
    fn test_truncated_text_gets_suffix() {
        let mut m = Message::standalone(12, 4);
        m.reset(Level::Info, None);
        m.append(1u32).append(2u32).append(3u32);
        let mut renderer = renderer().with_truncated_suffix("...");
        let rendered = renderer.render(&m);
        assert!(rendered.is_truncated());
        assert_eq!(rendered.text(), "12...");
    }

    #[test]
    fn test_datetime_and_duration() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 500_000_000).unwrap();
        let mut m = message();
        m.append_formatted(at, "%Y-%m-%d")
            .append(" ")
            .append_formatted(at, "%Q bogus")
            .append(" ")
            .append(Duration::from_millis(1500));
        let expected = format!("2023-11-14 {} {:?}", at.format(DATETIME_DEFAULT), Duration::from_millis(1500));
        assert_eq!(renderer().render(&m).text(), expected);
    }

    #[test]
    fn test_malformed_buffer_keeps_decoded_prefix() {
        let mut m = message();
        m.append("ok ").append(5u32);
        // The u32 tag follows the 3-byte string argument.
        m.encoded_mut()[3] = 0x60;

        let mut renderer = renderer();
        let rendered = renderer.render(&m);
        assert_eq!(
            rendered.decode_error(),
            Some(&DecodeError::UnknownDiscriminant { tag: 0x60, offset: 3 })
        );
        assert_eq!(rendered.text(), "ok [undecodable message: unknown discriminant 0x60 at offset 3]");
    }

    #[test]
    fn test_bad_string_index_is_reported() {
        let mut m = message();
        m.append(1u8).append("lost");
        m.encoded_mut()[3..5].copy_from_slice(&9u16.to_le_bytes());

        let mut renderer = renderer();
        let rendered = renderer.render(&m);
        assert_eq!(rendered.decode_error(), Some(&DecodeError::StringIndex { index: 9, count: 1 }));
        assert_eq!(rendered.text(), "1 [undecodable message: string index 9 out of range, table holds 1]");
    }

    #[test]
    fn test_fallback_skips_type_lookups() {
        let mut m = message();
        m.append_template("{0} {1}")
            .append_enum(Side::Sell)
            .append_formatted(255u32, "#x")
            .append_key_value("px", 1.5f64);
        let mut renderer = renderer();
        let rendered = renderer.render_fallback(&m, "boom");
        assert_eq!(rendered.text(), "1255 [render panicked: boom]");
        let pairs: Vec<_> = rendered.key_values().collect();
        assert_eq!(pairs, vec![("px", "1.5")]);
    }

    #[test]
    fn test_write_line_layout() {
        let mut m = message();
        let name: Arc<str> = Arc::from("orders.api");
        m.reset(Level::Warn, Some(&name));
        m.append("slow").append_key_value("ms", 250u32);
        let mut renderer = renderer();
        let line = renderer.render(&m).to_line();
        assert!(line.ends_with(" [WARN ] orders.api: slow ms=250"), "{}", line);
    }
}
