//! Shared types for cloudtail
//!
//! This crate contains data structures used across multiple cloudtail crates.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Severity
// ============================================================================

/// Cloud Logging severity, ordered from least to most severe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Default,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Severity {
    /// Every severity, lowest first
    pub const ALL: [Severity; 9] = [
        Self::Default,
        Self::Debug,
        Self::Info,
        Self::Notice,
        Self::Warning,
        Self::Error,
        Self::Critical,
        Self::Alert,
        Self::Emergency,
    ];

    /// Canonical uppercase name, as used by the query language
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Alert => "ALERT",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the nine severity names
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity {0:?}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|severity| severity.as_str() == upper)
            .ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

// ============================================================================
// Log Entries
// ============================================================================

/// The monitored resource that produced an entry
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type", default)]
    pub resource_type: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Entry body; Cloud Logging sets at most one of these
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Proto(serde_json::Value),
    Empty,
}

/// A single log entry returned by the backend
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    /// Backend-assigned unique ID (`insertId`)
    pub insert_id: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// When the backend received it (if reported)
    pub receive_timestamp: Option<DateTime<Utc>>,

    pub severity: Severity,

    /// Full resource name of the log, e.g. `projects/p/logs/syslog`
    pub log_name: String,

    pub resource: MonitoredResource,

    pub payload: Payload,
}

/// A raw entry that could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum MalformedEntry {
    #[error("entry could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("entry has no insertId")]
    MissingId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    #[serde(default)]
    insert_id: String,
    timestamp: DateTime<Utc>,
    receive_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    log_name: String,
    #[serde(default)]
    resource: MonitoredResource,
    text_payload: Option<String>,
    json_payload: Option<serde_json::Value>,
    proto_payload: Option<serde_json::Value>,
}

impl LogEntry {
    /// Decode an entry from the backend's JSON representation
    pub fn from_json(value: serde_json::Value) -> Result<Self, MalformedEntry> {
        let wire: WireEntry = serde_json::from_value(value)?;
        if wire.insert_id.is_empty() {
            return Err(MalformedEntry::MissingId);
        }

        let payload = match (wire.text_payload, wire.json_payload, wire.proto_payload) {
            (Some(text), _, _) => Payload::Text(text),
            (None, Some(json), _) => Payload::Json(json),
            (None, None, Some(proto)) => Payload::Proto(proto),
            (None, None, None) => Payload::Empty,
        };

        Ok(Self {
            insert_id: wire.insert_id,
            timestamp: wire.timestamp,
            receive_timestamp: wire.receive_timestamp,
            severity: wire.severity,
            log_name: wire.log_name,
            resource: wire.resource,
            payload,
        })
    }

    /// Short log name (the part after `/logs/`, percent-encoded slashes restored)
    pub fn short_log_name(&self) -> String {
        let name = self
            .log_name
            .rsplit_once("/logs/")
            .map(|(_, name)| name)
            .unwrap_or(&self.log_name);
        name.replace("%2F", "/")
    }

    /// Get the message content (text payload, or a common JSON message field)
    pub fn message(&self) -> String {
        match &self.payload {
            Payload::Text(text) => text.clone(),
            Payload::Json(value) | Payload::Proto(value) => {
                for key in &["message", "msg", "text"] {
                    if let Some(serde_json::Value::String(s)) = value.get(*key) {
                        return s.clone();
                    }
                }
                value.to_string()
            }
            Payload::Empty => String::new(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.severity,
            self.short_log_name(),
            self.message()
        )
    }
}
