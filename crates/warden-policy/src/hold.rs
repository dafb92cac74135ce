//! Spend holds
//!
//! A hold reserves allowance against a policy before the final amount is
//! known to have moved. Placing a hold counts toward every limit exactly
//! like a spend; capturing it keeps the reservation, releasing it gives the
//! allowance back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use warden_types::{Amount, HoldId, MerchantId, PolicyId};

use crate::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Held,
    Captured,
    Released,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Captured => "captured",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub policy_id: PolicyId,
    pub amount: Amount,
    pub merchant_id: MerchantId,
    pub status: HoldStatus,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Result of a hold request: the decision, and the hold when allowed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldOutcome {
    pub decision: Decision,
    pub hold: Option<Hold>,
}
