use crate::backend::BackendError;
use cluster_core::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode session: {0}")]
    Encode(String),

    #[error("Adapter closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Why a session could not be restored. Callers treat every variant as "start
/// a fresh session".
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Invalid offset: {0}")]
    InvalidCursor(String),

    #[error("Session or offset not found")]
    NotFound,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Failed to decode session: {0}")]
    Decode(String),
}
