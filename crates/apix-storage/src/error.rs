use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unreachable: {0}")]
    Unavailable(String),
    #[error("storage operation failed: {0}")]
    Operation(String),
    #[error("value at key was not valid utf-8 or not the expected shape")]
    Malformed,
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StorageError::Unavailable(err.to_string())
        } else {
            StorageError::Operation(err.to_string())
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::Operation(err.to_string()),
        }
    }
}
