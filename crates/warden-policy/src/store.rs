//! PolicyStore: spending policies, their windows and running totals
//!
//! A policy, its windows, its velocity records and its holds live in one
//! row, so the single row lock covers every read and write a spend
//! evaluation needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use warden_audit::{AuditLog, AuditRecord, AuditStream};
use warden_types::{
    AgentId, Amount, Clock, Currency, HoldId, MerchantId, PolicyId, RowGuard, RowTable, SharedClock,
    WardenError,
};

use crate::{
    actions, Hold, PolicyError, ReasonCode, Result, TimeWindowLimit, VelocityLog, VelocityRecord,
    WindowStatus, WindowType,
};

/// Durable spending policy of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingPolicy {
    pub id: PolicyId,
    pub subject: AgentId,
    pub currency: Currency,
    pub limit_per_tx: Amount,
    pub limit_total: Amount,
    pub spent_total: Amount,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPolicy {
    pub subject: AgentId,
    pub currency: Currency,
    pub limit_per_tx: Amount,
    pub limit_total: Amount,
    #[serde(default)]
    pub windows: Vec<(WindowType, Amount)>,
}

impl NewPolicy {
    pub fn new(subject: AgentId, currency: Currency, limit_per_tx: Amount, limit_total: Amount) -> Self {
        Self {
            subject,
            currency,
            limit_per_tx,
            limit_total,
            windows: Vec::new(),
        }
    }

    pub fn with_window(mut self, window_type: WindowType, limit: Amount) -> Self {
        self.windows.push((window_type, limit));
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.limit_per_tx.is_positive() {
            return Err(PolicyError::InvalidPolicy {
                reason: "limit_per_tx must be positive".to_string(),
            });
        }
        if !self.limit_total.is_positive() {
            return Err(PolicyError::InvalidPolicy {
                reason: "limit_total must be positive".to_string(),
            });
        }
        let mut seen = Vec::new();
        for (window_type, limit) in &self.windows {
            if !limit.is_positive() {
                return Err(PolicyError::InvalidPolicy {
                    reason: format!("{} limit must be positive", window_type),
                });
            }
            if seen.contains(window_type) {
                return Err(PolicyError::InvalidPolicy {
                    reason: format!("duplicate {} window", window_type),
                });
            }
            seen.push(*window_type);
        }
        Ok(())
    }
}

/// Everything guarded by one policy row lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRow {
    pub policy: SpendingPolicy,
    pub windows: Vec<TimeWindowLimit>,
    pub velocity: VelocityLog,
    pub holds: BTreeMap<HoldId, Hold>,
}

impl PolicyRow {
    /// Reset every expired window; returns the types that were reset
    pub(crate) fn apply_resets(&mut self, now: DateTime<Utc>) -> Vec<WindowType> {
        self.windows
            .iter_mut()
            .filter_map(|w| w.reset_if_expired(now).then_some(w.window_type))
            .collect()
    }

    /// Steps 2-4 of the evaluation order, against already-reset windows
    pub(crate) fn limit_violation(&self, amount: Amount) -> Result<Option<ReasonCode>> {
        if amount > self.policy.limit_per_tx {
            return Ok(Some(ReasonCode::PerTransactionLimit));
        }
        let new_total = self.policy.spent_total.try_add(amount)?;
        if new_total > self.policy.limit_total {
            return Ok(Some(ReasonCode::TotalLimitExceeded));
        }
        for window in &self.windows {
            let new_spent = window.current_spent.try_add(amount)?;
            if new_spent > window.limit_amount {
                return Ok(Some(ReasonCode::for_window(window.window_type)));
            }
        }
        Ok(None)
    }

    /// Count a spend against the total, every window and velocity
    pub(crate) fn apply_spend(
        &mut self,
        amount: Amount,
        merchant_id: &MerchantId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.policy.spent_total = self.policy.spent_total.try_add(amount)?;
        for window in &mut self.windows {
            window.current_spent = window.current_spent.try_add(amount)?;
        }
        self.velocity.push(VelocityRecord {
            policy_id: self.policy.id.clone(),
            recorded_at: now,
            amount,
            merchant_id: merchant_id.clone(),
        });
        self.touch(now);
        Ok(())
    }

    /// Give back allowance for a spend made at `spent_at`, including its
    /// velocity slot. Windows that have rolled over since then are left
    /// alone. Returns whether a velocity record was released.
    pub(crate) fn compensate(
        &mut self,
        amount: Amount,
        spent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.policy.spent_total = self.policy.spent_total.saturating_sub_floor_zero(amount);
        for window in &mut self.windows {
            if !window.is_expired(now) && window.covers(spent_at) {
                window.current_spent = window.current_spent.saturating_sub_floor_zero(amount);
            }
        }
        let released = self.velocity.remove_spend(spent_at, amount);
        self.touch(now);
        released
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.policy.version += 1;
        self.policy.updated_at = now;
    }

    /// Compact state used as the old/new value of audit entries
    pub(crate) fn audit_state(&self) -> Value {
        json!({
            "spent_total": self.policy.spent_total,
            "version": self.policy.version,
            "windows": self.windows.iter().map(|w| json!({
                "window_type": w.window_type,
                "window_start": w.window_start,
                "current_spent": w.current_spent,
                "limit_amount": w.limit_amount,
            })).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn stream(&self) -> AuditStream {
        AuditStream::new("policy", &self.policy.id)
    }
}

/// Policy with its effective window view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy: SpendingPolicy,
    pub windows: Vec<WindowStatus>,
    pub active_holds: Vec<Hold>,
}

/// Storage for spending policies
pub struct PolicyStore {
    rows: RowTable<PolicyId, PolicyRow>,
    hold_index: DashMap<HoldId, PolicyId>,
    audit: Arc<dyn AuditLog>,
    clock: SharedClock,
}

impl PolicyStore {
    pub fn new(audit: Arc<dyn AuditLog>, clock: SharedClock, lock_timeout: StdDuration) -> Self {
        Self {
            rows: RowTable::new("policy", lock_timeout),
            hold_index: DashMap::new(),
            audit,
            clock,
        }
    }

    /// Create a policy; the policy exists only once its audit entry is written
    pub async fn create_policy(&self, new: NewPolicy, actor: &str) -> Result<SpendingPolicy> {
        new.validate()?;
        let now = self.clock.now();
        let id = PolicyId::new();
        let windows = new
            .windows
            .iter()
            .map(|(window_type, limit)| {
                TimeWindowLimit::new(*window_type, *limit, new.currency.clone(), now)
            })
            .collect();

        let row = PolicyRow {
            policy: SpendingPolicy {
                id: id.clone(),
                subject: new.subject,
                currency: new.currency,
                limit_per_tx: new.limit_per_tx,
                limit_total: new.limit_total,
                spent_total: Amount::zero(),
                version: 1,
                created_at: now,
                updated_at: now,
            },
            windows,
            velocity: VelocityLog::default(),
            holds: BTreeMap::new(),
        };

        let record = AuditRecord::new(row.stream(), actions::POLICY_CREATED, actor, now).with_new(
            json!({
                "subject": row.policy.subject,
                "currency": row.policy.currency,
                "limit_per_tx": row.policy.limit_per_tx,
                "limit_total": row.policy.limit_total,
                "state": row.audit_state(),
            }),
        );
        self.audit.append(record).await?;

        let policy = row.policy.clone();
        if !self.rows.insert(id.clone(), row) {
            return Err(WardenError::internal(format!("duplicate policy id {}", id)).into());
        }
        info!(policy_id = %id, subject = %policy.subject, limit_total = %policy.limit_total, "Policy created");
        Ok(policy)
    }

    /// Policy and windows as they are effective now (expired windows shown reset)
    pub async fn get_policy(&self, policy_id: &PolicyId) -> Result<Option<PolicySnapshot>> {
        let now = self.clock.now();
        Ok(self.rows.snapshot(policy_id).await?.map(|row| PolicySnapshot {
            windows: row
                .windows
                .iter()
                .map(|w| WindowStatus::from(&w.effective(now)))
                .collect(),
            active_holds: row
                .holds
                .values()
                .filter(|h| h.status == crate::HoldStatus::Held)
                .cloned()
                .collect(),
            policy: row.policy,
        }))
    }

    /// Effective window view at the current time
    pub async fn window_status(&self, policy_id: &PolicyId) -> Result<Vec<WindowStatus>> {
        self.get_policy(policy_id)
            .await?
            .map(|snapshot| snapshot.windows)
            .ok_or_else(|| PolicyError::PolicyNotFound {
                policy_id: policy_id.to_string(),
            })
    }

    pub fn policy_ids(&self) -> Vec<PolicyId> {
        self.rows.keys()
    }

    pub fn policy_count(&self) -> usize {
        self.rows.len()
    }

    pub(crate) async fn lock(&self, policy_id: &PolicyId) -> Result<Option<RowGuard<PolicyRow>>> {
        Ok(self.rows.lock(policy_id).await?)
    }

    pub(crate) fn index_hold(&self, hold_id: HoldId, policy_id: PolicyId) {
        self.hold_index.insert(hold_id, policy_id);
    }

    pub(crate) fn policy_for_hold(&self, hold_id: &HoldId) -> Option<PolicyId> {
        self.hold_index.get(hold_id).map(|p| p.value().clone())
    }

    pub(crate) fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
