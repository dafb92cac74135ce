//! Rolling time-window limits
//!
//! Windows have fixed durations: daily is 24 hours, weekly 7 × 24 hours and
//! monthly 30 × 24 hours. A window is reset lazily, at evaluation time, once
//! `now >= window_start + duration`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use warden_types::{Amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Daily,
    Weekly,
    Monthly,
}

impl WindowType {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Daily => Duration::hours(24),
            Self::Weekly => Duration::hours(7 * 24),
            Self::Monthly => Duration::hours(30 * 24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit over one time window, owned by a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowLimit {
    pub window_type: WindowType,
    pub window_start: DateTime<Utc>,
    pub limit_amount: Amount,
    pub current_spent: Amount,
    pub currency: Currency,
}

impl TimeWindowLimit {
    pub fn new(
        window_type: WindowType,
        limit_amount: Amount,
        currency: Currency,
        window_start: DateTime<Utc>,
    ) -> Self {
        Self {
            window_type,
            window_start,
            limit_amount,
            current_spent: Amount::zero(),
            currency,
        }
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + self.window_type.duration()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.resets_at()
    }

    /// Reset if expired; returns whether a reset happened
    pub fn reset_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            self.current_spent = Amount::zero();
            self.window_start = now;
            true
        } else {
            false
        }
    }

    /// Whether a spend placed at `at` still counts toward the current period
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        at >= self.window_start
    }

    /// The window as it would look at `now` without mutating it
    pub fn effective(&self, now: DateTime<Utc>) -> Self {
        let mut view = self.clone();
        view.reset_if_expired(now);
        view
    }

    /// Remaining allowance, never negative
    pub fn remaining(&self) -> Amount {
        self.limit_amount.saturating_sub_floor_zero(self.current_spent)
    }
}

/// Read-only view of a window for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window_type: WindowType,
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub limit_amount: Amount,
    pub current_spent: Amount,
    pub remaining: Amount,
    pub currency: Currency,
}

impl From<&TimeWindowLimit> for WindowStatus {
    fn from(window: &TimeWindowLimit) -> Self {
        Self {
            window_type: window.window_type,
            window_start: window.window_start,
            resets_at: window.resets_at(),
            limit_amount: window.limit_amount,
            current_spent: window.current_spent,
            remaining: window.remaining(),
            currency: window.currency.clone(),
        }
    }
}
