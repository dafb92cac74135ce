//! Warden Approval - Human-in-the-loop escalation
//!
//! Spends that a policy defers to a human become [`Approval`] requests. An
//! approval is decided once, before it expires; anything other than an
//! explicit approval blocks the payment that references it.
//!
//! Expiry needs no scheduler: it is applied lazily on read, and
//! [`ApprovalGate::sweep_expired`] settles the rest.

pub mod gate;

pub use gate::*;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_audit::AuditError;
use warden_types::{Amount, ApprovalId, Metadata, Retriable, WardenError};

/// Audit actions written on approval streams
pub mod actions {
    pub const APPROVAL_REQUESTED: &str = "approval_requested";
    pub const APPROVAL_APPROVED: &str = "approval_approved";
    pub const APPROVAL_DENIED: &str = "approval_denied";
    pub const APPROVAL_EXPIRED: &str = "approval_expired";
    pub const APPROVAL_CANCELLED: &str = "approval_cancelled";
}

/// Errors from the approval gate
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Approval not found: {approval_id}")]
    ApprovalNotFound { approval_id: String },

    #[error("Approval {approval_id} expired at {expired_at}")]
    ApprovalExpired {
        approval_id: String,
        expired_at: DateTime<Utc>,
    },

    #[error("Approval {approval_id} is {status}, expected pending")]
    NotPending { approval_id: String, status: String },

    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl ApprovalError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Audit(err) => err.is_retriable(),
            Self::Core(err) => err.is_retriable(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ApprovalNotFound { .. } => "APPROVAL_NOT_FOUND",
            Self::ApprovalExpired { .. } => "APPROVAL_EXPIRED",
            Self::NotPending { .. } => "APPROVAL_NOT_PENDING",
            Self::Audit(err) => err.error_code(),
            Self::Core(err) => err.error_code(),
        }
    }
}

impl Retriable for ApprovalError {
    fn is_retriable(&self) -> bool {
        ApprovalError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

/// How quickly a human needs to look at the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Approval lifecycle. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A reviewer's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Time-to-live per urgency, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalTtls {
    pub critical_secs: u64,
    pub high_secs: u64,
    pub normal_secs: u64,
    pub low_secs: u64,
}

impl Default for ApprovalTtls {
    fn default() -> Self {
        Self {
            critical_secs: 15 * 60,
            high_secs: 60 * 60,
            normal_secs: 4 * 60 * 60,
            low_secs: 24 * 60 * 60,
        }
    }
}

impl ApprovalTtls {
    pub fn ttl(&self, urgency: Urgency) -> Duration {
        let secs = match urgency {
            Urgency::Critical => self.critical_secs,
            Urgency::High => self.high_secs,
            Urgency::Normal => self.normal_secs,
            Urgency::Low => self.low_secs,
        };
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn validate(&self) -> std::result::Result<(), WardenError> {
        for (name, secs) in [
            ("critical_secs", self.critical_secs),
            ("high_secs", self.high_secs),
            ("normal_secs", self.normal_secs),
            ("low_secs", self.low_secs),
        ] {
            if secs == 0 {
                return Err(WardenError::invalid_input(
                    format!("approval.ttls.{}", name),
                    "must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// An escalated action awaiting a human decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub action: String,
    pub amount: Amount,
    pub requested_by: String,
    pub urgency: Urgency,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reviewer: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl Approval {
    /// Still pending but past its deadline
    pub fn is_due_to_expire(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now >= self.expires_at
    }
}

/// What a payment referencing an approval may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    /// Approved: the payment may debit funds
    Proceed,
    /// Still pending
    AwaitingDecision,
    /// Denied, expired or cancelled
    Blocked { status: ApprovalStatus },
}

impl GateOutcome {
    pub fn for_status(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Approved => Self::Proceed,
            ApprovalStatus::Pending => Self::AwaitingDecision,
            status => Self::Blocked { status },
        }
    }

    pub fn may_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}
