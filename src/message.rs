use std::error::Error as StdError;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};

use crate::argument::{ArgumentType, Encode, EnumArg, Primitive, StrRef, FORMAT_FLAG};
use crate::level::Level;
use crate::segment::Segment;
use crate::type_registry::{LogEnum, UnmanagedStruct};

/// An error attached to a message. Kept by reference, never serialized.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Where a message came from, and so where it goes once dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Part of a pool's free list.
    Pooled,
    /// The pool's reserved message for exhaustion warnings.
    Reserved,
    /// Built on demand outside any pool and dropped after dispatch.
    Transient,
}

thread_local! {
    static CURRENT_THREAD: ThreadId = thread::current().id();
}

/// One log event: metadata plus an encoded argument buffer.
///
/// A message owns a fixed-size [`Segment`] and writes every appended value
/// into it as a discriminant byte followed by a fixed-size payload (see
/// [`argument`](crate::argument) for the layout). Strings are not copied:
/// they go into a small string table whose capacity is fixed when the
/// message is created, and only their two-byte index lands in the buffer.
///
/// # Capacity
///
/// The last byte of the segment is kept in reserve. When a value does not
/// fit, an `EndOfTruncatedMessage` marker is written into the space that is
/// left and every later append on the message does nothing. When the string
/// table is full, string values are dropped without touching the buffer.
///
/// # Ownership
///
/// Exactly one thread holds a message at a time. The producer fills it,
/// hands it to the queue and never sees it again; the dispatcher decodes it
/// and gives it back to the pool. Moving the boxed message is what enforces
/// this, so the buffer itself needs no locking.
///
/// # Examples
///
/// ```
/// # use pooled_logger::message::Message;
/// # use pooled_logger::level::Level;
/// let mut message = Message::standalone(64, 4);
/// message.reset(Level::Info, None);
/// message.append("Count ").append(42i32);
/// assert!(!message.is_truncated());
/// assert_eq!(message.string_count(), 1);
/// ```
pub struct Message {
    level: Level,
    timestamp: DateTime<Utc>,
    thread: ThreadId,
    logger: Option<Arc<str>>,
    error: Option<SharedError>,
    segment: Segment,
    cursor: usize,
    strings: Vec<StrRef>,
    string_capacity: usize,
    truncated: bool,
    origin: Origin,
}

impl Message {
    pub(crate) fn new(segment: Segment, string_capacity: usize, origin: Origin) -> Self {
        assert!(!segment.is_empty(), "message segment must not be empty");
        Self {
            level: Level::Info,
            timestamp: Utc::now(),
            thread: CURRENT_THREAD.with(|id| *id),
            logger: None,
            error: None,
            segment,
            cursor: 0,
            strings: Vec::with_capacity(string_capacity),
            string_capacity,
            truncated: false,
            origin,
        }
    }

    /// A message with its own buffer, outside any pool.
    pub fn standalone(buffer_size: usize, string_capacity: usize) -> Self {
        Self::new(Segment::standalone(buffer_size), string_capacity, Origin::Transient)
    }

    /// Clears the message for a new event and stamps level, time, calling
    /// thread and logger name.
    pub fn reset(&mut self, level: Level, logger: Option<&Arc<str>>) {
        self.level = level;
        self.timestamp = Utc::now();
        self.thread = CURRENT_THREAD.with(|id| *id);
        self.logger = logger.cloned();
        self.error = None;
        self.cursor = 0;
        self.strings.clear();
        self.truncated = false;
    }

    #[inline(always)]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline(always)]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[inline(always)]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn logger_name(&self) -> Option<&str> {
        self.logger.as_deref()
    }

    pub(crate) fn logger_arc(&self) -> Option<&Arc<str>> {
        self.logger.as_ref()
    }

    pub fn error(&self) -> Option<&SharedError> {
        self.error.as_ref()
    }

    /// The bytes written so far, including the truncation marker if any.
    #[inline(always)]
    pub fn encoded(&self) -> &[u8] {
        &self.segment.as_slice()[..self.cursor]
    }

    #[cfg(test)]
    pub(crate) fn encoded_mut(&mut self) -> &mut [u8] {
        let cursor = self.cursor;
        &mut self.segment.as_mut_slice()[..cursor]
    }

    #[inline(always)]
    pub fn strings(&self) -> &[StrRef] {
        &self.strings
    }

    #[inline(always)]
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn string_capacity(&self) -> usize {
        self.string_capacity
    }

    pub fn buffer_capacity(&self) -> usize {
        self.segment.len()
    }

    #[inline(always)]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[inline(always)]
    pub(crate) fn origin(&self) -> Origin {
        self.origin
    }

    /// Appends any encodable value: primitives, `&'static str`, `Arc<str>`,
    /// [`StrRef`], [`EnumArg`] and `Option`s of those.
    #[inline(always)]
    pub fn append<T: Encode>(&mut self, value: T) -> &mut Self {
        value.encode(self, None);
        self
    }

    /// Appends a value together with a format specifier, see
    /// [`format_spec`](crate::format_spec).
    #[inline(always)]
    pub fn append_formatted<T: Encode>(&mut self, value: T, format: &'static str) -> &mut Self {
        value.encode(self, Some(format));
        self
    }

    /// Appends a string by reference.
    #[inline(always)]
    pub fn append_string(&mut self, value: impl Into<StrRef>) -> &mut Self {
        self.write_string(value.into(), None);
        self
    }

    /// Copies a borrowed string into the buffer. Unlike
    /// [`append_string`](Self::append_string) this works for short-lived
    /// strings, at the cost of buffer space.
    pub fn append_inline_str(&mut self, value: &str) -> &mut Self {
        if value.len() > usize::from(u16::MAX) {
            self.mark_truncated();
            return self;
        }
        let Some(start) = self.reserve(1 + 2 + value.len()) else {
            return self;
        };
        let buf = self.segment.as_mut_slice();
        buf[start] = ArgumentType::InlineString as u8;
        buf[start + 1..start + 3].copy_from_slice(&(value.len() as u16).to_le_bytes());
        buf[start + 3..start + 3 + value.len()].copy_from_slice(value.as_bytes());
        self
    }

    #[inline(always)]
    pub fn append_enum<E: LogEnum>(&mut self, value: E) -> &mut Self {
        self.write_enum(E::TYPE_ID, value.to_raw(), None);
        self
    }

    #[inline(always)]
    pub fn append_enum_option<E: LogEnum>(&mut self, value: Option<E>) -> &mut Self {
        value.map(EnumArg).encode(self, None);
        self
    }

    /// Copies a plain-data struct into the buffer. Rendering needs the type
    /// to be registered, see [`type_registry`](crate::type_registry).
    #[inline(always)]
    pub fn append_unmanaged<T: UnmanagedStruct>(&mut self, value: &T) -> &mut Self {
        self.write_unmanaged(value, None);
        self
    }

    #[inline(always)]
    pub fn append_unmanaged_formatted<T: UnmanagedStruct>(
        &mut self,
        value: &T,
        format: &'static str,
    ) -> &mut Self {
        self.write_unmanaged(value, Some(format));
        self
    }

    pub fn append_unmanaged_option<T: UnmanagedStruct>(&mut self, value: Option<&T>) -> &mut Self {
        match value {
            Some(value) => self.write_unmanaged(value, None),
            None => self.write_null(),
        }
        self
    }

    /// Appends a structured key/value pair. Pairs are rendered apart from the
    /// message text. If the key or the value cannot be stored, neither is.
    pub fn append_key_value<T: Encode>(&mut self, key: &'static str, value: T) -> &mut Self {
        if self.truncated || self.strings.len() >= self.string_capacity {
            return self;
        }
        let Some(start) = self.reserve(1 + 2) else {
            return self;
        };
        let index = self.push_string(StrRef::Static(key));
        let buf = self.segment.as_mut_slice();
        buf[start] = ArgumentType::KeyString as u8;
        buf[start + 1..start + 3].copy_from_slice(&index.to_le_bytes());

        let after_key = self.cursor;
        value.encode(self, None);
        if !self.truncated && self.cursor == after_key {
            self.cursor = start;
            self.strings.pop();
        }
        self
    }

    /// Captures a `{0}`, `{1}`, … template. The arguments appended after it
    /// are substituted into it when the message is rendered.
    pub fn append_template(&mut self, template: impl Into<StrRef>) -> &mut Self {
        if self.truncated || self.strings.len() >= self.string_capacity {
            return self;
        }
        let Some(start) = self.reserve(1 + 2) else {
            return self;
        };
        let index = self.push_string(template.into());
        let buf = self.segment.as_mut_slice();
        buf[start] = ArgumentType::FormatString as u8;
        buf[start + 1..start + 3].copy_from_slice(&index.to_le_bytes());
        self
    }

    pub fn with_error(&mut self, error: SharedError) -> &mut Self {
        self.error = Some(error);
        self
    }

    pub(crate) fn write_primitive<T: Primitive>(&mut self, value: T, format: Option<&'static str>) {
        let format = self.format_slot(format, 0);
        let size = 1 + T::SIZE + format_size(format);
        let Some(start) = self.reserve(size) else {
            return;
        };
        let buf = self.segment.as_mut_slice();
        buf[start] = tag(T::TYPE, format);
        value.write_to(&mut buf[start + 1..start + 1 + T::SIZE]);
        self.finish_format(format, start + 1 + T::SIZE);
    }

    pub(crate) fn write_null(&mut self) {
        if let Some(start) = self.reserve(1) {
            self.segment.as_mut_slice()[start] = ArgumentType::Null as u8;
        }
    }

    pub(crate) fn write_string(&mut self, value: StrRef, format: Option<&'static str>) {
        if self.truncated || self.strings.len() >= self.string_capacity {
            return;
        }
        let format = self.format_slot(format, 1);
        let size = 1 + 2 + format_size(format);
        let Some(start) = self.reserve(size) else {
            return;
        };
        let index = self.push_string(value);
        let buf = self.segment.as_mut_slice();
        buf[start] = tag(ArgumentType::String, format);
        buf[start + 1..start + 3].copy_from_slice(&index.to_le_bytes());
        self.finish_format(format, start + 3);
    }

    pub(crate) fn write_enum(&mut self, type_id: u32, raw: u64, format: Option<&'static str>) {
        let format = self.format_slot(format, 0);
        let size = 1 + 4 + 8 + format_size(format);
        let Some(start) = self.reserve(size) else {
            return;
        };
        let buf = self.segment.as_mut_slice();
        buf[start] = tag(ArgumentType::Enum, format);
        buf[start + 1..start + 5].copy_from_slice(&type_id.to_le_bytes());
        buf[start + 5..start + 13].copy_from_slice(&raw.to_le_bytes());
        self.finish_format(format, start + 13);
    }

    fn write_unmanaged<T: UnmanagedStruct>(&mut self, value: &T, format: Option<&'static str>) {
        if size_of::<T>() > usize::from(u16::MAX) {
            self.mark_truncated();
            return;
        }
        let bytes = bytemuck::bytes_of(value);
        let format = self.format_slot(format, 0);
        let size = 1 + 4 + 2 + bytes.len() + format_size(format);
        let Some(start) = self.reserve(size) else {
            return;
        };
        let end = start + 7 + bytes.len();
        let buf = self.segment.as_mut_slice();
        buf[start] = tag(ArgumentType::Unmanaged, format);
        buf[start + 1..start + 5].copy_from_slice(&T::TYPE_ID.to_le_bytes());
        buf[start + 5..start + 7].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        buf[start + 7..end].copy_from_slice(bytes);
        self.finish_format(format, end);
    }

    /// Keeps the format specifier only if the string table has room for it
    /// on top of `other_slots` strings the value itself needs.
    #[inline(always)]
    fn format_slot(&self, format: Option<&'static str>, other_slots: usize) -> Option<&'static str> {
        format.filter(|_| self.strings.len() + other_slots < self.string_capacity)
    }

    #[inline(always)]
    fn finish_format(&mut self, format: Option<&'static str>, at: usize) {
        if let Some(format) = format {
            let index = self.push_string(StrRef::Static(format));
            self.segment.as_mut_slice()[at..at + 2].copy_from_slice(&index.to_le_bytes());
        }
    }

    #[inline(always)]
    fn push_string(&mut self, value: StrRef) -> u16 {
        debug_assert!(self.strings.len() < self.string_capacity);
        self.strings.push(value);
        (self.strings.len() - 1) as u16
    }

    /// Claims `len` bytes at the cursor, or writes the truncation marker if
    /// they do not fit in front of the reserved last byte.
    #[inline(always)]
    fn reserve(&mut self, len: usize) -> Option<usize> {
        if self.truncated {
            return None;
        }
        let limit = self.segment.len() - 1;
        if self.cursor + len > limit {
            self.mark_truncated();
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(start)
    }

    fn mark_truncated(&mut self) {
        if self.truncated {
            return;
        }
        let cursor = self.cursor;
        self.segment.as_mut_slice()[cursor] = ArgumentType::EndOfTruncatedMessage as u8;
        self.cursor += 1;
        self.truncated = true;
    }
}

#[inline(always)]
fn tag(kind: ArgumentType, format: Option<&'static str>) -> u8 {
    kind as u8 | if format.is_some() { FORMAT_FLAG } else { 0 }
}

#[inline(always)]
fn format_size(format: Option<&'static str>) -> usize {
    if format.is_some() {
        2
    } else {
        0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("level", &self.level)
            .field("logger", &self.logger)
            .field("encoded_len", &self.cursor)
            .field("strings", &self.strings.len())
            .field("truncated", &self.truncated)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
