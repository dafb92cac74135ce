//! Engine events for subscribers (operators, dashboards, alerting)
//!
//! Events are broadcast to every subscriber after the state change they
//! describe has been committed and audited. Delivery is best effort: a
//! subscriber that lags loses events, the audit log does not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_approval::{ApprovalStatus, Urgency};
use warden_ledger::CommitResult;
use warden_policy::{Decision, ReasonCode};
use warden_reconciliation::{
    BreakType, JourneyBreakStatus, JourneyState, JourneyUpdate, ReconciliationBreak, Severity,
};
use warden_types::{
    Amount, ApprovalId, BatchId, BreakId, JourneyId, OrgId, PolicyId, TransferId,
};

/// Engine-wide events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WardenEvent {
    /// A spend was evaluated
    SpendDecided {
        policy_id: PolicyId,
        amount: Amount,
        allowed: bool,
        reason_code: ReasonCode,
        timestamp: DateTime<Utc>,
    },

    /// An allowed spend was given back
    SpendReversed {
        policy_id: PolicyId,
        amount: Amount,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A batch was published to the ledger
    BatchCommitted {
        batch_id: BatchId,
        transfer_id: TransferId,
        entry_count: usize,
        first_sequence: u64,
        last_sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pending batch was abandoned
    BatchRolledBack {
        batch_id: BatchId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider event reached a journey
    JourneyUpdated {
        journey_id: JourneyId,
        organization: OrgId,
        state: JourneyState,
        break_status: JourneyBreakStatus,
        duplicate: bool,
        timestamp: DateTime<Utc>,
    },

    /// A break was opened or changed
    BreakRaised {
        break_id: BreakId,
        journey_id: JourneyId,
        break_type: BreakType,
        severity: Severity,
        delta: Amount,
        timestamp: DateTime<Utc>,
    },

    ApprovalRequested {
        approval_id: ApprovalId,
        urgency: Urgency,
        amount: Amount,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    ApprovalDecided {
        approval_id: ApprovalId,
        status: ApprovalStatus,
        reviewer: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A maintenance run finished
    MaintenanceCompleted {
        anchors_created: usize,
        velocity_pruned: usize,
        approvals_expired: usize,
        failures: usize,
        timestamp: DateTime<Utc>,
    },
}

impl WardenEvent {
    pub fn spend_decided(decision: &Decision) -> Self {
        Self::SpendDecided {
            policy_id: decision.policy_id.clone(),
            amount: decision.amount,
            allowed: decision.allowed,
            reason_code: decision.reason_code,
            timestamp: decision.decided_at,
        }
    }

    pub fn batch_committed(result: &CommitResult) -> Self {
        Self::BatchCommitted {
            batch_id: result.batch_id.clone(),
            transfer_id: result.transfer_id.clone(),
            entry_count: result.entries.len(),
            first_sequence: result.first_sequence().unwrap_or_default(),
            last_sequence: result.last_sequence().unwrap_or_default(),
            timestamp: result.committed_at,
        }
    }

    pub fn journey_updated(update: &JourneyUpdate) -> Self {
        Self::JourneyUpdated {
            journey_id: update.journey.id.clone(),
            organization: update.journey.organization.clone(),
            state: update.journey.canonical_state,
            break_status: update.journey.break_status,
            duplicate: update.is_duplicate(),
            timestamp: update.event.recorded_at,
        }
    }

    pub fn break_raised(item: &ReconciliationBreak) -> Self {
        Self::BreakRaised {
            break_id: item.id.clone(),
            journey_id: item.journey_id.clone(),
            break_type: item.break_type,
            severity: item.severity,
            delta: item.delta,
            timestamp: item.updated_at,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SpendDecided { timestamp, .. }
            | Self::SpendReversed { timestamp, .. }
            | Self::BatchCommitted { timestamp, .. }
            | Self::BatchRolledBack { timestamp, .. }
            | Self::JourneyUpdated { timestamp, .. }
            | Self::BreakRaised { timestamp, .. }
            | Self::ApprovalRequested { timestamp, .. }
            | Self::ApprovalDecided { timestamp, .. }
            | Self::MaintenanceCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// One-line description for logs and feeds
    pub fn summary(&self) -> String {
        match self {
            Self::SpendDecided { policy_id, amount, allowed: true, .. } => {
                format!("Spend of {} allowed on {}", amount, policy_id)
            }
            Self::SpendDecided { policy_id, amount, reason_code, .. } => {
                format!("Spend of {} declined on {} ({})", amount, policy_id, reason_code)
            }
            Self::SpendReversed { policy_id, amount, reason, .. } => {
                format!("Spend of {} reversed on {}: {}", amount, policy_id, reason)
            }
            Self::BatchCommitted { batch_id, entry_count, first_sequence, last_sequence, .. } => {
                format!(
                    "Batch {} committed: {} entries, seq {}..={}",
                    batch_id, entry_count, first_sequence, last_sequence
                )
            }
            Self::BatchRolledBack { batch_id, reason, .. } => {
                format!("Batch {} rolled back: {}", batch_id, reason)
            }
            Self::JourneyUpdated { journey_id, state, duplicate: true, .. } => {
                format!("Duplicate event on journey {} ({})", journey_id, state)
            }
            Self::JourneyUpdated { journey_id, state, .. } => {
                format!("Journey {} is {}", journey_id, state)
            }
            Self::BreakRaised { break_type, severity, journey_id, delta, .. } => {
                format!(
                    "{} break ({}) on journey {}, delta {}",
                    break_type, severity, journey_id, delta
                )
            }
            Self::ApprovalRequested { approval_id, urgency, amount, .. } => {
                format!("Approval {} requested for {} ({})", approval_id, amount, urgency)
            }
            Self::ApprovalDecided { approval_id, status, .. } => {
                format!("Approval {} is {}", approval_id, status)
            }
            Self::MaintenanceCompleted { anchors_created, velocity_pruned, approvals_expired, failures, .. } => {
                format!(
                    "Maintenance: {} anchors, {} velocity records pruned, {} approvals expired, {} failures",
                    anchors_created, velocity_pruned, approvals_expired, failures
                )
            }
        }
    }
}
