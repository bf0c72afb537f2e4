use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// How a failure is handled by the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection/API trouble; the next tick retries naturally.
    Transient,
    /// Bad pool configuration; recurs until fixed externally.
    Configuration,
    /// Local persistence failed.
    Store,
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("pool {0} not found")]
    PoolNotFound(Uuid),
    #[error("configuration {0} not found")]
    ConfigNotFound(Uuid),
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Remote(_) | FleetError::Timeout(_) => ErrorKind::Transient,
            FleetError::Config(_) | FleetError::ConfigNotFound(_) => ErrorKind::Configuration,
            FleetError::Store(_) | FleetError::PoolNotFound(_) => ErrorKind::Store,
        }
    }

    /// Wrap a provider error (anyhow) as a transient remote failure.
    pub fn remote(err: impl std::fmt::Display) -> Self {
        FleetError::Remote(err.to_string())
    }
}
