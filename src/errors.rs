//! Typed error hierarchy for the Fireside portal.
//!
//! `PortalError` is the single domain error. Database operations raise it
//! wrapped in `anyhow::Error` so the HTTP layer can downcast it back into a
//! status code; everything else (I/O, SQLite, serialization) stays as plain
//! `anyhow` context chains and surfaces as a 500.

use thiserror::Error;

/// Errors raised by portal operations.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    /// The entity exists but its current state does not allow the operation
    /// (locked review, released summary, inactive assignment).
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PortalError {
    pub fn forbidden() -> Self {
        Self::Forbidden("Forbidden".to_string())
    }

    pub fn locked() -> Self {
        Self::Conflict("Review is submitted and locked".to_string())
    }
}

/// Shorthand for raising a `PortalError` through an `anyhow::Result` chain.
pub fn portal_err(err: PortalError) -> anyhow::Error {
    anyhow::Error::new(err)
}
