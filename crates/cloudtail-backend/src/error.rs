use thiserror::Error;

/// Errors returned by a log backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Temporary condition; the same query may succeed later
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the query (bad filter, permissions, unknown project)
    #[error("backend rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body could not be understood
    #[error("unreadable backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether retrying the same query can help
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}
