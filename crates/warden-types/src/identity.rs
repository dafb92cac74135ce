//! Identity types for Warden
//!
//! All identity types are strongly typed wrappers around UUIDs to prevent
//! accidental mixing of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// The string prefix used by this ID type
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }
    };
}

// Spend enforcement
define_id_type!(PolicyId, "policy", "Unique identifier for a spending policy");
define_id_type!(AgentId, "agent", "Unique identifier for a spending agent");
define_id_type!(MerchantId, "merchant", "Unique identifier for a merchant");
define_id_type!(HoldId, "hold", "Unique identifier for a spend hold");

// Ledger
define_id_type!(AccountId, "acct", "Unique identifier for a ledger account");
define_id_type!(TransferId, "xfer", "Unique identifier for a money transfer");
define_id_type!(BatchId, "batch", "Unique identifier for a ledger batch");
define_id_type!(EntryId, "entry", "Unique identifier for a ledger entry");
define_id_type!(AnchorId, "anchor", "Unique identifier for a Merkle anchor record");

// Reconciliation
define_id_type!(OrgId, "org", "Unique identifier for an organization");
define_id_type!(JourneyId, "journey", "Unique identifier for a canonical transfer journey");
define_id_type!(EventId, "evt", "Unique identifier for a canonical settlement event");
define_id_type!(BreakId, "break", "Unique identifier for a reconciliation break");
define_id_type!(ReviewItemId, "review", "Unique identifier for a manual review item");

// Approvals and audit
define_id_type!(ApprovalId, "approval", "Unique identifier for an approval request");
define_id_type!(AuditEntryId, "audit", "Unique identifier for an audit log entry");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_id_creation() {
        let id = PolicyId::new();
        assert!(id.to_string().starts_with("policy_"));
    }

    #[test]
    fn test_id_parsing() {
        let id = JourneyId::new();
        let parsed = JourneyId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let bare = JourneyId::parse(&id.0.to_string()).unwrap();
        assert_eq!(id, bare);
    }

    #[test]
    fn test_id_equality() {
        let uuid = Uuid::new_v4();
        assert_eq!(AgentId::from_uuid(uuid), AgentId::from_uuid(uuid));
        assert_eq!(BatchId::prefix(), "batch");
    }
}
