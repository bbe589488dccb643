//! Error types shared by the API clients and the pipeline.

use std::fmt;

/// Error returned by one of the external services
#[derive(Debug, Clone)]
pub struct ApiError {
    /// Which service failed ("telegram", "gemini", "drive")
    pub service: &'static str,
    pub message: String,
    /// HTTP status code if the service answered at all
    pub status_code: Option<u16>,
}

impl ApiError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            service,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(service: &'static str, message: impl Into<String>, status_code: u16) -> Self {
        ApiError {
            service,
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Rate limiting, gateway errors and transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self.status_code {
            Some(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
            None => true,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self.status_code, Some(401) | Some(403))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status_code {
            write!(f, "{} API error [HTTP {}]: {}", self.service, code, self.message)
        } else {
            write!(f, "{} API error: {}", self.service, self.message)
        }
    }
}

impl std::error::Error for ApiError {}

/// Failure while writing the deck package
#[derive(Debug, thiserror::Error)]
pub enum DeckError {
    #[error("collection database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("package archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("deck I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deck metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("missing environment variables: {}", .0.join(", "))]
    MissingConfig(Vec<String>),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Deck(#[from] DeckError),
    #[error("inbox database error: {0}")]
    Inbox(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
