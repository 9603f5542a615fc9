//! Ready-made sinks.
//!
//! [`ConsoleSink`] and [`FileSink`] write the default line format from
//! [`RenderedMessage::write_line`]. [`MemorySink`] keeps structured copies
//! of everything it receives and is mostly useful in tests.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::level::Level;
use crate::render::RenderedMessage;
use crate::sink::{Sink, SinkError};

/// An owned copy of a rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub level: Level,
    pub logger: String,
    pub text: String,
    pub key_values: Vec<(String, String)>,
    pub error: Option<String>,
    pub truncated: bool,
}

/// Collects messages in memory. Clones share the same record list.
///
/// ```
/// # use pooled_logger::sinks::MemorySink;
/// # use pooled_logger::level::Level;
/// let sink = MemorySink::new("mem", Level::Info);
/// let view = sink.clone();
/// assert!(view.records().is_empty());
/// ```
#[derive(Clone)]
pub struct MemorySink {
    name: String,
    minimum_level: Level,
    records: Arc<Mutex<Vec<MemoryRecord>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>, minimum_level: Level) -> Self {
        Self {
            name: name.into(),
            minimum_level,
            records: Arc::new(Mutex::new(Vec::new())),
            flushes: Arc::new(Mutex::new(0)),
        }
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records.lock().clone()
    }

    /// Just the message texts, in arrival order.
    pub fn texts(&self) -> Vec<String> {
        self.records.lock().iter().map(|record| record.text.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// How many times the dispatcher flushed this sink.
    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    fn write(&mut self, message: &RenderedMessage) -> std::result::Result<(), SinkError> {
        let record = MemoryRecord {
            level: message.level(),
            logger: message.logger_name().to_string(),
            text: message.text().to_string(),
            key_values: message
                .key_values()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            error: message.error().map(|err| err.to_string()),
            truncated: message.is_truncated(),
        };
        self.records.lock().push(record);
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), SinkError> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}

/// Writes lines to standard output through a buffer that is flushed once
/// per dispatcher batch.
pub struct ConsoleSink {
    name: String,
    minimum_level: Level,
    out: BufWriter<Stdout>,
    line: String,
}

impl ConsoleSink {
    pub fn new(minimum_level: Level) -> Self {
        Self::named("console", minimum_level)
    }

    pub fn named(name: impl Into<String>, minimum_level: Level) -> Self {
        Self {
            name: name.into(),
            minimum_level,
            out: BufWriter::new(io::stdout()),
            line: String::with_capacity(256),
        }
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    fn write(&mut self, message: &RenderedMessage) -> std::result::Result<(), SinkError> {
        write_line(&mut self.line, &mut self.out, message)
    }

    fn flush(&mut self) -> std::result::Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }

    fn dispose(&mut self) -> std::result::Result<(), SinkError> {
        self.flush()
    }
}

/// Appends lines to a file.
///
/// ```
/// # use pooled_logger::sinks::FileSink;
/// # use pooled_logger::level::Level;
/// let dir = tempfile::tempdir().unwrap();
/// let sink = FileSink::create("file", dir.path().join("app.log"), Level::Debug).unwrap();
/// assert!(sink.path().ends_with("app.log"));
/// ```
pub struct FileSink {
    name: String,
    minimum_level: Level,
    path: PathBuf,
    out: Option<BufWriter<File>>,
    line: String,
}

impl FileSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn create(name: impl Into<String>, path: impl AsRef<Path>, minimum_level: Level) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name: name.into(),
            minimum_level,
            path,
            out: Some(BufWriter::new(file)),
            line: String::with_capacity(256),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    fn write(&mut self, message: &RenderedMessage) -> std::result::Result<(), SinkError> {
        let out = self.out.as_mut().ok_or(SinkError::Closed)?;
        write_line(&mut self.line, out, message)
    }

    fn flush(&mut self) -> std::result::Result<(), SinkError> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    fn dispose(&mut self) -> std::result::Result<(), SinkError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        Ok(())
    }
}

fn write_line<W: Write>(line: &mut String, out: &mut W, message: &RenderedMessage) -> std::result::Result<(), SinkError> {
    line.clear();
    message
        .write_line(line)
        .map_err(|_| SinkError::rejected("failed to format line"))?;
    line.push('\n');
    out.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::render::Renderer;
    use crate::type_registry::TypeRegistry;

    fn render_into(sink: &mut dyn Sink, text: &'static str) {
        let mut renderer = Renderer::new(Arc::new(TypeRegistry::new()));
        let mut message = Message::standalone(64, 4);
        message.reset(Level::Info, None);
        message.append(text).append_key_value("n", 1u8);
        sink.write(renderer.render(&message)).unwrap();
    }

    #[test]
    fn test_memory_sink_clones_share_records() {
        let sink = MemorySink::new("mem", Level::Trace);
        let mut writer = sink.clone();
        render_into(&mut writer, "hello");
        writer.flush().unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "hello");
        assert_eq!(records[0].key_values, vec![("n".to_string(), "1".to_string())]);
        assert_eq!(sink.flush_count(), 1);
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut sink = FileSink::create("file", &path, Level::Trace).unwrap();
        render_into(&mut sink, "first");
        render_into(&mut sink, "second");
        sink.dispose().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO ] first n=1"), "{}", lines[0]);
        assert!(lines[1].ends_with("[INFO ] second n=1"), "{}", lines[1]);
    }

    #[test]
    fn test_file_sink_rejects_writes_after_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create("file", dir.path().join("x.log"), Level::Trace).unwrap();
        sink.dispose().unwrap();

        let mut renderer = Renderer::new(Arc::new(TypeRegistry::new()));
        let mut message = Message::standalone(16, 1);
        message.reset(Level::Info, None);
        assert!(matches!(sink.write(renderer.render(&message)), Err(SinkError::Closed)));
    }
}
