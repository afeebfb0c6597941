use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use cloudtail_types::LogEntry;

use crate::error::SinkError;

/// Ordered destination for emitted entries
///
/// Entries must reach the destination in the order `write` is called, and a
/// successful `write` must not be lost if the process stops right after.
pub trait OutputSink {
    fn write(&mut self, entry: &LogEntry) -> Result<(), SinkError>;
}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn write(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
        (**self).write(entry)
    }
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn write(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
        (**self).write(entry)
    }
}

/// One line per entry on any writer, flushed after each entry
pub struct WriterSink<W: Write> {
    writer: W,
}

/// Entries printed to standard output
pub type TerminalSink = WriterSink<Stdout>;

/// Entries appended to a file
pub type FileSink = WriterSink<File>;

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl WriterSink<File> {
    /// Open `path` for appending, creating it if needed
    pub fn append_to(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(file))
    }
}

impl<W: Write> OutputSink for WriterSink<W> {
    fn write(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
        writeln!(self.writer, "{entry}")?;
        self.writer.flush()?;
        Ok(())
    }
}
