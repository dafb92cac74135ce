//! Warden Reconciliation - Canonical journeys and break detection
//!
//! Provider events (webhooks, statements, chain confirmations) are folded
//! into one [`CanonicalJourney`] per transfer. Deterministic [`BreakRules`]
//! compare what settled against what was expected and raise
//! [`ReconciliationBreak`]s; serious ones are queued for a human as
//! [`ManualReviewItem`]s.
//!
//! # Invariants
//!
//! 1. Replaying a `(provider, provider_event_id)` never changes a journey
//! 2. `canonical_state` only moves forward, whatever order events arrive in
//! 3. At most one unresolved break per (journey, break type)
//! 4. A journey change, its event and its breaks are audited together

pub mod breaks;
pub mod engine;
pub mod event;
pub mod journey;

pub use breaks::*;
pub use engine::*;
pub use event::*;
pub use journey::*;

use thiserror::Error;
use warden_audit::AuditError;
use warden_types::{Retriable, WardenError};

/// Audit actions written by reconciliation
pub mod actions {
    pub const JOURNEY_CREATED: &str = "journey_created";
    pub const EVENT_APPLIED: &str = "event_applied";
    pub const EVENT_IGNORED: &str = "event_ignored";
    pub const EVENT_DUPLICATE: &str = "event_duplicate";
    pub const EXPECTATION_UPDATED: &str = "expectation_updated";
    pub const INGESTION_FAILED: &str = "ingestion_failed";
    pub const JOURNEY_BREAKS_RESOLVED: &str = "journey_breaks_resolved";
    pub const BREAK_OPENED: &str = "break_opened";
    pub const BREAK_UPDATED: &str = "break_updated";
    pub const BREAK_ACKNOWLEDGED: &str = "break_acknowledged";
    pub const BREAK_RESOLVED: &str = "break_resolved";
    pub const REVIEW_QUEUED: &str = "review_queued";
    pub const REVIEW_CLAIMED: &str = "review_claimed";
    pub const REVIEW_RESOLVED: &str = "review_resolved";
    pub const REVIEW_DISMISSED: &str = "review_dismissed";
}

/// Errors from reconciliation
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Journey not found: {journey_id}")]
    JourneyNotFound { journey_id: String },

    #[error("Break not found: {break_id}")]
    BreakNotFound { break_id: String },

    #[error("Review item not found: {item_id}")]
    ReviewItemNotFound { item_id: String },

    #[error("Cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid provider payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl ReconciliationError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Audit(err) => err.is_retriable(),
            Self::Core(err) => err.is_retriable(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JourneyNotFound { .. } => "JOURNEY_NOT_FOUND",
            Self::BreakNotFound { .. } => "BREAK_NOT_FOUND",
            Self::ReviewItemNotFound { .. } => "REVIEW_ITEM_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::Audit(err) => err.error_code(),
            Self::Core(err) => err.error_code(),
        }
    }
}

impl Retriable for ReconciliationError {
    fn is_retriable(&self) -> bool {
        ReconciliationError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, ReconciliationError>;
