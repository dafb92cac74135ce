//! Error types shared by every Warden crate
//!
//! Component crates define their own error enums and wrap `WardenError`
//! for the cross-cutting failures listed here.

use crate::Retriable;
use thiserror::Error;

/// Result type for Warden foundation operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Cross-cutting failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WardenError {
    // ========================================================================
    // Amount Errors
    // ========================================================================

    /// Amount overflow during arithmetic
    #[error("Amount overflow during arithmetic operation")]
    AmountOverflow,

    /// Currency mismatch
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    // ========================================================================
    // Concurrency & Storage Errors
    // ========================================================================

    /// Row lock could not be acquired in time
    #[error("Timed out waiting for lock on {resource}")]
    LockTimeout { resource: String },

    /// Backing store unavailable
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// Audit sink rejected a write
    #[error("Audit write failed: {message}")]
    AuditWriteFailed { message: String },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Invalid input
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// Serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WardenError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
        }
    }

    /// Check if this is a retriable error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::StorageUnavailable { .. }
        )
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::AuditWriteFailed { .. } => "AUDIT_WRITE_FAILED",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl Retriable for WardenError {
    fn is_retriable(&self) -> bool {
        WardenError::is_retriable(self)
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
