use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistlockError {
    #[error("unsupported operation: {op} on backend {backend}")]
    Unsupported { op: &'static str, backend: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend call timed out: {op} on backend {backend}")]
    Timeout { op: &'static str, backend: String },
    #[error("lock {name} is held by another token")]
    NotHolder { name: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("lock acquisition cancelled: {0}")]
    Cancelled(String),
    #[error("watch failed on channel {channel}: {reason}")]
    Watch { channel: String, reason: String },
}

impl DistlockError {
    pub fn unsupported(op: &'static str, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            op,
            backend: backend.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

pub type Result<T> = std::result::Result<T, DistlockError>;
