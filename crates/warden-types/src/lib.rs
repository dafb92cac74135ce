//! Warden Types - Canonical domain types for spend enforcement
//!
//! This crate contains the foundational types shared by every Warden crate
//! with zero dependencies on other warden crates:
//!
//! - Identity types (PolicyId, AgentId, BatchId, JourneyId, ...)
//! - Minor-unit amounts and currency codes
//! - Bounded metadata attached to spends and approvals
//! - An injectable clock so time-dependent rules are testable
//! - Row locks with bounded acquisition
//! - Retry policy with exponential backoff
//!
//! # Invariants
//!
//! 1. Amounts are signed 64-bit minor units; arithmetic is always checked
//! 2. Failure is explicit: every fallible operation returns a typed error
//! 3. Nothing blocks indefinitely: lock waits are bounded by a timeout

pub mod identity;
pub mod currency;
pub mod amount;
pub mod metadata;
pub mod clock;
pub mod lock;
pub mod retry;
pub mod error;

pub use identity::*;
pub use currency::*;
pub use amount::*;
pub use metadata::*;
pub use clock::*;
pub use lock::*;
pub use retry::*;
pub use error::*;

/// Version of the Warden types schema
pub const TYPES_VERSION: &str = "0.1.0";
