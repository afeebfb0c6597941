//! Cloud Logging client for cloudtail
//!
//! This crate provides the backend seam the tail engine queries through,
//! and its implementation against the Cloud Logging `entries:list` API.

mod client;
mod error;

pub use client::{CloudLoggingClient, DEFAULT_ENDPOINT};
pub use error::BackendError;

/// A single query against the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendQuery {
    /// Filter expression in the backend's query language
    pub filter: String,

    /// Stop collecting once this many entries are returned (None = all)
    pub max_entries: Option<usize>,
}

impl BackendQuery {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            max_entries: None,
        }
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// Source of raw log entries
///
/// Implementations return entries as raw JSON so that a single undecodable
/// record can be skipped by the caller instead of failing the whole fetch.
/// Entries should come back oldest first, though callers must not rely on it.
pub trait LogBackend {
    fn fetch(
        &self,
        query: &BackendQuery,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, BackendError>> + Send;
}
