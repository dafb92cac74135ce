//! Canonical journeys: one normalized state record per logical transfer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use warden_types::{Amount, Currency, JourneyId, OrgId};

use crate::{CanonicalEventType, ProviderEvent};

/// Settlement rail a transfer travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    BankTransfer,
    Card,
    OnChain,
}

impl std::fmt::Display for Rail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BankTransfer => write!(f, "bank_transfer"),
            Self::Card => write!(f, "card"),
            Self::OnChain => write!(f, "on_chain"),
        }
    }
}

/// Canonical settlement state
///
/// ```text
/// created -> pending -> settled | failed | returned
///                       settled -> returned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyState {
    Created,
    Pending,
    Settled,
    Failed,
    Returned,
}

impl JourneyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Failed | Self::Returned)
    }

    /// Whether moving to `next` goes forward
    pub fn can_move_to(self, next: Self) -> bool {
        use JourneyState::*;
        matches!(
            (self, next),
            (Created, Pending | Settled | Failed | Returned)
                | (Pending, Settled | Failed | Returned)
                | (Settled, Returned)
        )
    }
}

impl std::fmt::Display for JourneyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Pending => write!(f, "pending"),
            Self::Settled => write!(f, "settled"),
            Self::Failed => write!(f, "failed"),
            Self::Returned => write!(f, "returned"),
        }
    }
}

/// Break summary carried on the journey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyBreakStatus {
    Ok,
    DriftOpen,
    ReviewOpen,
    Resolved,
}

/// Lookup key of a journey
///
/// External references are only unique within one provider, so two
/// providers reporting the same reference track separate journeys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JourneyKey {
    pub organization: OrgId,
    pub rail: Rail,
    pub provider: String,
    pub external_reference: String,
}

impl JourneyKey {
    pub fn new(
        organization: OrgId,
        rail: Rail,
        provider: impl Into<String>,
        external_reference: impl Into<String>,
    ) -> Self {
        Self {
            organization,
            rail,
            provider: provider.into(),
            external_reference: external_reference.into(),
        }
    }
}

/// Normalized state of one transfer across all provider events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalJourney {
    pub id: JourneyId,
    pub organization: OrgId,
    pub rail: Rail,
    pub provider: String,
    pub external_reference: String,
    pub canonical_state: JourneyState,
    pub expected_amount: Amount,
    pub settled_amount: Amount,
    pub currency: Option<Currency>,
    pub retry_count: u32,
    pub last_return_code: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub break_status: JourneyBreakStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalJourney {
    pub(crate) fn new(id: JourneyId, key: &JourneyKey, now: DateTime<Utc>) -> Self {
        Self {
            id,
            organization: key.organization.clone(),
            rail: key.rail,
            provider: key.provider.clone(),
            external_reference: key.external_reference.clone(),
            canonical_state: JourneyState::Created,
            expected_amount: Amount::zero(),
            settled_amount: Amount::zero(),
            currency: None,
            retry_count: 0,
            last_return_code: None,
            last_event_at: None,
            break_status: JourneyBreakStatus::Ok,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> JourneyKey {
        JourneyKey::new(
            self.organization.clone(),
            self.rail,
            self.provider.clone(),
            self.external_reference.clone(),
        )
    }

    /// Signed difference `settled - expected`, saturating
    pub fn delta(&self) -> Amount {
        Amount::new(
            self.settled_amount
                .minor_units()
                .saturating_sub(self.expected_amount.minor_units()),
        )
    }

    /// Fold one event into the journey. Returns whether anything changed.
    ///
    /// Never moves `canonical_state` backward; an event whose transition is
    /// not forward changes nothing. A settlement without an amount settles
    /// for the expected amount; a return without an amount returns
    /// everything settled so far.
    pub(crate) fn apply(&mut self, event: &ProviderEvent) -> bool {
        let changed = match event.event_type {
            CanonicalEventType::Retried => {
                if self.canonical_state.is_terminal() {
                    false
                } else {
                    self.retry_count = self.retry_count.saturating_add(1);
                    self.canonical_state = JourneyState::Pending;
                    true
                }
            }
            event_type => {
                let target = event_type.target_state();
                if !self.canonical_state.can_move_to(target) {
                    false
                } else {
                    match target {
                        JourneyState::Settled => {
                            self.settled_amount = event.amount.unwrap_or(self.expected_amount)
                        }
                        JourneyState::Returned => {
                            self.settled_amount = match event.amount {
                                Some(amount) => self.settled_amount.saturating_sub_floor_zero(amount),
                                None => Amount::zero(),
                            }
                        }
                        _ => {}
                    }
                    self.canonical_state = target;
                    true
                }
            }
        };

        if changed {
            if let Some(code) = &event.return_code {
                self.last_return_code = Some(code.clone());
            }
            if self.currency.is_none() {
                self.currency = event.currency.clone();
            }
        }
        changed
    }

    pub(crate) fn observe_timestamp(&mut self, occurred_at: DateTime<Utc>) {
        if self.last_event_at.map_or(true, |last| occurred_at > last) {
            self.last_event_at = Some(occurred_at);
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Compact state for audit entries
    pub(crate) fn audit_state(&self) -> Value {
        json!({
            "canonical_state": self.canonical_state,
            "expected_amount": self.expected_amount,
            "settled_amount": self.settled_amount,
            "retry_count": self.retry_count,
            "last_return_code": self.last_return_code,
            "break_status": self.break_status,
            "version": self.version,
        })
    }
}
