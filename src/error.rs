//! Error types for the relay core.

/// Rejections raised synchronously by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Session queue is closed")]
    Closed,
}

/// Failures reported by an [`HttpFetcher`](crate::fetcher::HttpFetcher).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{0}")]
    Transport(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::Status(status.as_u16()),
            None => FetchError::Transport(err.to_string()),
        }
    }
}

/// Failures reported by a [`StorageClient`](crate::storage::StorageClient).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Remote(String),
}

/// Why a pipeline run did not end in `Done`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("{0}")]
    Metadata(String),

    #[error("{0}")]
    Transport(String),

    /// The source answered with a non-success status; never retried.
    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("{0}")]
    Upload(String),

    #[error("Cancelled by user")]
    Cancelled,
}

impl TransferError {
    /// The message shown to users: only the first line of the underlying error.
    pub fn status_line(&self) -> String {
        first_line(&self.to_string())
    }
}

impl From<FetchError> for TransferError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport(message) => TransferError::Transport(message),
            FetchError::Status(code) => TransferError::HttpStatus(code),
        }
    }
}

pub fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}
