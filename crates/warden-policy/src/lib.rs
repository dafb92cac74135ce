//! Warden Policy - Spending policies and atomic spend enforcement
//!
//! [`PolicyStore`] keeps each agent's spending policy, its rolling time
//! windows, velocity records and holds. [`SpendGuard`] decides whether a
//! proposed spend is allowed and records it in the same unit of work.
//!
//! # Invariants
//!
//! 1. `spent_total <= limit_total` for every policy, at every instant
//! 2. Concurrent spends on one policy serialize on its row lock, so no
//!    interleaving grants two spends that jointly exceed a limit
//! 3. Fail closed: a spend that cannot be evaluated is declined
//! 4. Every state change writes exactly one audit entry, and is discarded
//!    if that write fails

pub mod decision;
pub mod window;
pub mod velocity;
pub mod hold;
pub mod store;
pub mod guard;

pub use decision::*;
pub use window::*;
pub use velocity::{VelocityLog, VelocityRecord};
pub use hold::*;
pub use store::*;
pub use guard::*;

use thiserror::Error;
use warden_audit::AuditError;
use warden_types::{Retriable, WardenError};

/// Audit actions written on policy streams
pub mod actions {
    pub const POLICY_CREATED: &str = "policy_created";
    pub const SPEND_RECORDED: &str = "spend_recorded";
    pub const SPEND_REVERSED: &str = "spend_reversed";
    pub const WINDOW_RESET: &str = "window_reset";
    pub const HOLD_PLACED: &str = "hold_placed";
    pub const HOLD_CAPTURED: &str = "hold_captured";
    pub const HOLD_RELEASED: &str = "hold_released";
}

/// Errors that can occur in policy operations
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy not found: {policy_id}")]
    PolicyNotFound { policy_id: String },

    #[error("Invalid policy: {reason}")]
    InvalidPolicy { reason: String },

    #[error("Hold not found: {hold_id}")]
    HoldNotFound { hold_id: String },

    #[error("Hold {hold_id} is already {status}")]
    InvalidHoldState { hold_id: String, status: String },

    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl PolicyError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Audit(err) => err.is_retriable(),
            Self::Core(err) => err.is_retriable(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PolicyNotFound { .. } => "POLICY_NOT_FOUND",
            Self::InvalidPolicy { .. } => "INVALID_POLICY",
            Self::HoldNotFound { .. } => "HOLD_NOT_FOUND",
            Self::InvalidHoldState { .. } => "INVALID_HOLD_STATE",
            Self::Audit(err) => err.error_code(),
            Self::Core(err) => err.error_code(),
        }
    }
}

impl Retriable for PolicyError {
    fn is_retriable(&self) -> bool {
        PolicyError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
