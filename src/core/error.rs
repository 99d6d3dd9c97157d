use super::LogicalId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed for {entity}.{field}: {message}")]
    Validation {
        entity: String,
        field: String,
        message: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Concurrent update detected for logical id {logical_id} of '{entity}'")]
    Concurrency { entity: String, logical_id: LogicalId },

    #[error("Unique query matched {0} rows")]
    NotUnique(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown field '{field}' for entity '{entity}'")]
    UnknownField { entity: String, field: String },

    #[error("Transaction operation error: {0}")]
    TransactionOperation(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl StoreError {
    pub(crate) fn validation(
        entity: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            entity: entity.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Only a lost optimistic race is worth retrying after a re-fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
