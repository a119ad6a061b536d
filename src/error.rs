use thiserror::Error;

/// Failures a caller can observe: everything that happens before the
/// acknowledgment is sent.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("local persistence failed: {0}")]
    LocalPersistence(String),
}

impl SubmissionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn local_persistence(message: impl Into<String>) -> Self {
        Self::LocalPersistence(message.into())
    }

    /// Message without the variant prefix, suitable for an HTTP error body.
    pub fn detail(&self) -> &str {
        match self {
            Self::Validation(detail) | Self::LocalPersistence(detail) => detail,
        }
    }
}

/// Failures of a remote store. These only ever reach the logs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote transport error: {0}")]
    Transport(String),
    #[error("remote store answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to encode remote payload: {0}")]
    Encode(String),
    #[error("remote store misconfigured: {0}")]
    Config(String),
}

impl StoreError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SubmissionError>;
