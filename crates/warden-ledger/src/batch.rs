//! Ledger batches: entries staged together and published as one unit

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_types::{AccountId, Amount, BatchId, Currency, EntryId, TransferId};

use crate::{EntryStatus, EntryType, LedgerError, Result};

/// Lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Completed,
    RolledBack,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// An entry staged in a pending batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: Amount,
    pub currency: Currency,
    pub rail_reference: Option<String>,
    pub status: EntryStatus,
}

impl EntryDraft {
    pub fn new(account_id: AccountId, entry_type: EntryType, amount: Amount, currency: Currency) -> Self {
        Self {
            account_id,
            entry_type,
            amount,
            currency,
            rail_reference: None,
            status: EntryStatus::Posted,
        }
    }

    pub fn debit(account_id: AccountId, amount: Amount, currency: Currency) -> Self {
        Self::new(account_id, EntryType::Debit, amount, currency)
    }

    pub fn credit(account_id: AccountId, amount: Amount, currency: Currency) -> Self {
        Self::new(account_id, EntryType::Credit, amount, currency)
    }

    pub fn fee(account_id: AccountId, amount: Amount, currency: Currency) -> Self {
        Self::new(account_id, EntryType::Fee, amount, currency)
    }

    pub fn with_rail_reference(mut self, reference: impl Into<String>) -> Self {
        self.rail_reference = Some(reference.into());
        self
    }

    /// Mirror-image draft that undoes this one
    pub(crate) fn reversal(&self) -> Self {
        Self {
            account_id: self.account_id.clone(),
            entry_type: self.entry_type.mirror(),
            amount: self.amount,
            currency: self.currency.clone(),
            rail_reference: self.rail_reference.clone(),
            status: EntryStatus::Reversal,
        }
    }
}

/// A group of entries committed or rolled back together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBatch {
    pub id: BatchId,
    pub transfer_id: TransferId,
    pub status: BatchStatus,
    pub entry_count: usize,
    /// Sum of the debit and fee side
    pub total_amount: Amount,
    pub drafts: Vec<EntryDraft>,
    pub entry_ids: Vec<EntryId>,
    /// Set on a compensation batch: the batch it reverses
    pub compensates: Option<BatchId>,
    /// Set on a completed batch once it has been reversed
    pub compensated_by: Option<BatchId>,
    pub rollback_reason: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl LedgerBatch {
    pub(crate) fn new(transfer_id: TransferId, now: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new(),
            transfer_id,
            status: BatchStatus::Pending,
            entry_count: 0,
            total_amount: Amount::zero(),
            drafts: Vec::new(),
            entry_ids: Vec::new(),
            compensates: None,
            compensated_by: None,
            rollback_reason: None,
            rolled_back_at: None,
            created_at: now,
            committed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BatchStatus::Pending
    }

    pub(crate) fn ensure_pending(&self) -> Result<()> {
        match self.status {
            BatchStatus::Pending => Ok(()),
            BatchStatus::Completed => Err(LedgerError::BatchAlreadyCommitted {
                batch_id: self.id.to_string(),
            }),
            BatchStatus::RolledBack => Err(LedgerError::BatchNotPending {
                batch_id: self.id.to_string(),
                status: self.status.to_string(),
            }),
        }
    }

    /// Stage a draft; amounts must be strictly positive
    pub(crate) fn stage(&mut self, draft: EntryDraft) -> Result<()> {
        if !draft.amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                message: format!("entry amount must be positive, got {}", draft.amount),
            });
        }
        if draft.entry_type.is_outflow() {
            self.total_amount = self.total_amount.try_add(draft.amount)?;
        }
        self.drafts.push(draft);
        self.entry_count = self.drafts.len();
        Ok(())
    }

    /// Non-empty and netting to zero in every currency
    pub fn check_balanced(&self) -> Result<()> {
        if self.drafts.is_empty() {
            return Err(LedgerError::EmptyBatch {
                batch_id: self.id.to_string(),
            });
        }
        let mut net: BTreeMap<&Currency, Amount> = BTreeMap::new();
        for draft in &self.drafts {
            let signed = draft.entry_type.signed(draft.amount)?;
            let slot = net.entry(&draft.currency).or_insert_with(Amount::zero);
            *slot = slot.try_add(signed)?;
        }
        match net.into_iter().find(|(_, total)| !total.is_zero()) {
            Some((currency, total)) => Err(LedgerError::Unbalanced {
                batch_id: self.id.to_string(),
                currency: currency.to_string(),
                net: total.minor_units(),
            }),
            None => Ok(()),
        }
    }
}
