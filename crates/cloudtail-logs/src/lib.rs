//! Query building and tailing for cloudtail
//!
//! This crate validates filter flags, compiles them into the backend query
//! language, and runs the fetch/emit loop that writes entries to a sink.

mod cursor;
mod error;
mod filter;
mod sink;
mod tail;
mod validate;

pub use error::{SinkError, TailError, ValidationError};
pub use filter::{DEFAULT_LOOKBACK, Filter, FilterArgs, LowerBound, ResolvedFilter, format_timestamp};
pub use sink::{FileSink, OutputSink, TerminalSink, WriterSink};
pub use tail::{StopReason, TailConfig, TailEngine, TailOptions, TailSummary};
pub use validate::{validate_duration, validate_severity, validate_timestamp};

// Re-export types used in our public API
pub use cloudtail_types::{LogEntry, Severity};
