//! Warden Ledger - Batched double-entry ledger
//!
//! The ledger is:
//! - Batched (entries are staged in a pending batch and published together)
//! - Double-entry (every batch nets to zero per currency)
//! - Immutable (entries are append-only; mistakes are compensated, not edited)
//! - Hash-anchored (committed entries are periodically rolled into signed
//!   Merkle roots by [`AuditAnchor`])
//!
//! # Invariants
//!
//! 1. A committed batch is non-empty and balanced per currency
//! 2. `running_balance` of an entry equals the previous balance of its
//!    (account, currency) plus the entry's signed amount
//! 3. Sequence numbers are global, gap-free and monotonic
//! 4. A commit and its audit entries are published all-or-nothing

pub mod batch;
pub mod engine;
pub mod anchor;

pub use anchor::*;
pub use batch::*;
pub use engine::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_audit::AuditError;
use warden_crypto::CryptoError;
use warden_types::{
    AccountId, Amount, BatchId, Currency, EntryId, Retriable, TransferId, WardenError,
};

/// Audit actions written by the ledger
pub mod actions {
    pub const BATCH_COMMITTED: &str = "batch_committed";
    pub const BATCH_ROLLED_BACK: &str = "batch_rolled_back";
    pub const BATCH_COMPENSATED: &str = "batch_compensated";
    pub const BALANCE_POSTED: &str = "balance_posted";
    pub const ANCHOR_CREATED: &str = "anchor_created";
}

/// Errors that can occur in ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {message}")]
    InvalidAmount { message: String },

    #[error("Batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    #[error("Batch {batch_id} has no entries")]
    EmptyBatch { batch_id: String },

    #[error("Batch {batch_id} is unbalanced in {currency}: net {net}")]
    Unbalanced {
        batch_id: String,
        currency: String,
        net: i64,
    },

    #[error("Batch {batch_id} is already committed")]
    BatchAlreadyCommitted { batch_id: String },

    #[error("Batch {batch_id} is {status}, expected pending")]
    BatchNotPending { batch_id: String, status: String },

    #[error("Batch {batch_id} was already compensated by {compensated_by}")]
    BatchAlreadyCompensated {
        batch_id: String,
        compensated_by: String,
    },

    #[error("Entry not found: {entry_id}")]
    EntryNotFound { entry_id: String },

    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("Anchor crypto failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl LedgerError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Audit(err) => err.is_retriable(),
            Self::Core(err) => err.is_retriable(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::BatchNotFound { .. } => "BATCH_NOT_FOUND",
            Self::EmptyBatch { .. } => "EMPTY_BATCH",
            Self::Unbalanced { .. } => "UNBALANCED",
            Self::BatchAlreadyCommitted { .. } => "BATCH_ALREADY_COMMITTED",
            Self::BatchNotPending { .. } => "BATCH_NOT_PENDING",
            Self::BatchAlreadyCompensated { .. } => "BATCH_ALREADY_COMPENSATED",
            Self::EntryNotFound { .. } => "ENTRY_NOT_FOUND",
            Self::Audit(err) => err.error_code(),
            Self::Crypto(_) => "ANCHOR_CRYPTO_FAILED",
            Self::Core(err) => err.error_code(),
        }
    }
}

impl Retriable for LedgerError {
    fn is_retriable(&self) -> bool {
        LedgerError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Type of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Increase of the account balance
    Credit,
    /// Decrease of the account balance
    Debit,
    /// Decrease of the account balance charged as a fee
    Fee,
}

impl EntryType {
    /// Signed effect of `amount` on the account balance
    pub fn signed(self, amount: Amount) -> Result<Amount> {
        match self {
            Self::Credit => Ok(amount),
            Self::Debit | Self::Fee => amount
                .checked_neg()
                .ok_or_else(|| WardenError::AmountOverflow.into()),
        }
    }

    /// The entry type that undoes this one
    pub fn mirror(self) -> Self {
        match self {
            Self::Credit => Self::Debit,
            Self::Debit | Self::Fee => Self::Credit,
        }
    }

    pub fn is_outflow(self) -> bool {
        matches!(self, Self::Debit | Self::Fee)
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credit => write!(f, "credit"),
            Self::Debit => write!(f, "debit"),
            Self::Fee => write!(f, "fee"),
        }
    }
}

/// Whether an entry is an original posting or part of a compensation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Posted,
    Reversal,
}

/// A committed ledger entry (one leg of a balanced batch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Global, monotonic, starting at 1
    pub sequence: u64,
    pub batch_id: BatchId,
    pub transfer_id: TransferId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: Amount,
    /// Balance of (account, currency) after this entry
    pub running_balance: Amount,
    pub currency: Currency,
    pub rail_reference: Option<String>,
    pub status: EntryStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub batch_id: BatchId,
    pub transfer_id: TransferId,
    pub entries: Vec<LedgerEntry>,
    pub committed_at: DateTime<Utc>,
}

impl CommitResult {
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.first().map(|e| e.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }
}
