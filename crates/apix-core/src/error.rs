use apix_storage::StorageError;
use thiserror::Error;

/// The error taxonomy shared by every component in the event plane (spec
/// §7). Kinds, not per-component types: callers match on the kind to
/// decide propagation, not on which module raised it.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {action} on {resource}")]
    PermissionDenied { action: String, resource: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("out of order event: expected {expected}, got {actual}")]
    OutOfOrderEvent { expected: u64, actual: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// The frozen error code this maps to over the WS/REST surface (§7).
    pub fn code(&self) -> &'static str {
        use apix_protocol::error_codes::*;
        match self {
            CoreError::Auth(_) => AUTH_REQUIRED,
            CoreError::PermissionDenied { .. } => PERMISSION_DENIED,
            CoreError::QuotaExceeded(_) => QUOTA_EXCEEDED,
            CoreError::NotFound(_) => NOT_FOUND,
            CoreError::Conflict(_) => CONFLICT,
            CoreError::InvalidArgument(_) => INVALID_ARGUMENT,
            CoreError::DuplicateEvent(_) => DUPLICATE_EVENT,
            CoreError::OutOfOrderEvent { .. } => OUT_OF_ORDER_EVENT,
            CoreError::Transient(_) => INTERNAL_ERROR,
            CoreError::CircuitOpen(_) => CIRCUIT_OPEN,
            CoreError::Fatal(_) => INTERNAL_ERROR,
        }
    }

    /// The REST status code this kind surfaces as (§7).
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Auth(_) => 401,
            CoreError::PermissionDenied { .. } => 403,
            CoreError::QuotaExceeded(_) => 429,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::InvalidArgument(_) => 400,
            CoreError::DuplicateEvent(_) => 200,
            CoreError::OutOfOrderEvent { .. } => 200,
            CoreError::Transient(_) => 503,
            CoreError::CircuitOpen(_) => 503,
            CoreError::Fatal(_) => 500,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        CoreError::Transient(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
