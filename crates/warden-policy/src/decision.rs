//! Spend decisions and their reason codes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use warden_types::{Amount, PolicyId};

use crate::WindowType;

/// Stable reason code attached to every decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Approved,
    PolicyNotFound,
    InvalidAmount,
    PerTransactionLimit,
    TotalLimitExceeded,
    DailyLimitExceeded,
    WeeklyLimitExceeded,
    MonthlyLimitExceeded,
    VelocityLimitPerMinute,
    VelocityLimitPerHour,
    EvaluationFailed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::PolicyNotFound => "policy_not_found",
            Self::InvalidAmount => "invalid_amount",
            Self::PerTransactionLimit => "per_transaction_limit",
            Self::TotalLimitExceeded => "total_limit_exceeded",
            Self::DailyLimitExceeded => "daily_limit_exceeded",
            Self::WeeklyLimitExceeded => "weekly_limit_exceeded",
            Self::MonthlyLimitExceeded => "monthly_limit_exceeded",
            Self::VelocityLimitPerMinute => "velocity_limit_per_minute",
            Self::VelocityLimitPerHour => "velocity_limit_per_hour",
            Self::EvaluationFailed => "evaluation_failed",
        }
    }

    /// Reason code for a window whose limit would be exceeded
    pub fn for_window(window_type: WindowType) -> Self {
        match window_type {
            WindowType::Daily => Self::DailyLimitExceeded,
            WindowType::Weekly => Self::WeeklyLimitExceeded,
            WindowType::Monthly => Self::MonthlyLimitExceeded,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a spend evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason_code: ReasonCode,
    pub policy_id: PolicyId,
    pub amount: Amount,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn allow(policy_id: PolicyId, amount: Amount, decided_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            reason_code: ReasonCode::Approved,
            policy_id,
            amount,
            decided_at,
        }
    }

    pub fn decline(
        policy_id: PolicyId,
        amount: Amount,
        reason_code: ReasonCode,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: false,
            reason_code,
            policy_id,
            amount,
            decided_at,
        }
    }
}

/// Per-minute and per-hour transaction count ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityLimits {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
}

impl VelocityLimits {
    pub fn new(max_per_minute: u32, max_per_hour: u32) -> Self {
        Self {
            max_per_minute,
            max_per_hour,
        }
    }
}
