//! Transaction velocity tracking
//!
//! A record counts toward a window when it is strictly younger than the
//! window length: a record exactly 60 seconds old is outside the minute
//! window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use warden_types::{Amount, MerchantId, PolicyId};

use crate::{ReasonCode, VelocityLimits};

/// Longest window ever checked; pruning never removes younger records
pub fn min_retention() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityRecord {
    pub policy_id: PolicyId,
    pub recorded_at: DateTime<Utc>,
    pub amount: Amount,
    pub merchant_id: MerchantId,
}

/// Append-only, time-ordered velocity records of one policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityLog {
    records: VecDeque<VelocityRecord>,
}

impl VelocityLog {
    pub fn push(&mut self, record: VelocityRecord) {
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records strictly younger than `window` at `now`
    pub fn count_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.records
            .iter()
            .filter(|r| r.recorded_at > cutoff && r.recorded_at <= now)
            .count()
    }

    /// First velocity ceiling that one more transaction would break
    pub fn check(&self, now: DateTime<Utc>, limits: VelocityLimits) -> Option<ReasonCode> {
        if self.count_within(now, Duration::seconds(60)) >= limits.max_per_minute as usize {
            return Some(ReasonCode::VelocityLimitPerMinute);
        }
        if self.count_within(now, Duration::seconds(3600)) >= limits.max_per_hour as usize {
            return Some(ReasonCode::VelocityLimitPerHour);
        }
        None
    }

    /// Remove the record a compensated spend left behind. Returns whether
    /// one was found.
    pub fn remove_spend(&mut self, recorded_at: DateTime<Utc>, amount: Amount) -> bool {
        match self
            .records
            .iter()
            .position(|r| r.recorded_at == recorded_at && r.amount == amount)
        {
            Some(index) => self.records.remove(index).is_some(),
            None => false,
        }
    }

    /// Drop records older than `cutoff`; returns how many were removed
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.recorded_at >= cutoff);
        before - self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VelocityRecord> {
        self.records.iter()
    }
}
