use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Document not found")]
    DocumentNotFound,

    #[error("Document too large: {0}")]
    DocumentTooLarge(String),

    #[error("Unique constraint violated: {0}")]
    UniqueConstraintViolated(String),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Write throttle timeout")]
    WriteThrottleTimeout,

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Invalid collection type: {0}")]
    CollectionTypeInvalid(String),

    #[error("Illegal name: {0}")]
    IllegalName(String),

    #[error("Invalid key generator: {0}")]
    InvalidKeyGenerator(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Transaction internal error: {0}")]
    TransactionInternal(String),

    #[error("Collection '{0}' is not registered in the transaction")]
    TransactionUnregisteredCollection(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {}", err))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
