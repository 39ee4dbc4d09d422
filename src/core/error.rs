use thiserror::Error;

#[derive(Error, Debug)]
pub enum KronError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key '{0}' not found")]
    NotFound(String),

    #[error("Invalid schedule: {0}")]
    ScheduleParse(String),

    #[error("Value must be an integer: {0}")]
    NumericParse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl KronError {
    /// Short stable code for logs and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::ScheduleParse(_) => "schedule_parse",
            Self::NumericParse(_) => "numeric_parse",
            Self::Storage(_) => "storage",
            Self::Protocol(_) => "protocol",
            Self::Lock(_) => "lock",
        }
    }

    pub(crate) fn empty_key() -> Self {
        Self::Validation("key must not be empty".to_string())
    }
}

pub type Result<T> = std::result::Result<T, KronError>;

impl<T> From<std::sync::PoisonError<T>> for KronError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for KronError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for KronError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
