//! Engine configuration
//!
//! Every field has a default, so an empty document is a valid configuration.
//! The service binary layers files and `WARDEN__*` environment variables on
//! top of these defaults and calls [`WardenConfig::validate`] before use.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use warden_approval::ApprovalTtls;
use warden_policy::VelocityLimits;
use warden_reconciliation::BreakRules;
use warden_types::RetryPolicy;

use crate::{EngineError, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub spend: SpendConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Spend enforcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendConfig {
    /// Row lock wait bound in milliseconds, shared by every row table
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Velocity ceilings applied by `authorize_payment` when the request has none
    #[serde(default)]
    pub default_velocity: Option<VelocityLimits>,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            default_velocity: None,
        }
    }
}

impl SpendConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Ledger and anchoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Most entries rolled into one anchor
    #[serde(default = "default_anchor_max_leaves")]
    pub anchor_max_leaves: usize,

    /// Hex Ed25519 seed of the anchor signer; a fresh key is generated when unset
    #[serde(default)]
    pub anchor_signing_key: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            anchor_max_leaves: default_anchor_max_leaves(),
            anchor_signing_key: None,
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default)]
    pub rules: BreakRules,

    /// Retry budget for provider ingestion before a `retry_exhausted` break
    #[serde(default)]
    pub ingest_retry: RetryPolicy,
}

/// Approval settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub ttls: ApprovalTtls,
}

/// Maintenance job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between runs of the maintenance service
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Velocity records younger than this are kept
    #[serde(default = "default_velocity_retention_secs")]
    pub velocity_retention_secs: u64,

    /// Registered expectations no provider event matched within this
    /// window are dropped
    #[serde(default = "default_expectation_retention_secs")]
    pub expectation_retention_secs: u64,

    #[serde(default = "default_true")]
    pub anchor_enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            velocity_retention_secs: default_velocity_retention_secs(),
            expectation_retention_secs: default_expectation_retention_secs(),
            anchor_enabled: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn velocity_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.velocity_retention_secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn expectation_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.expectation_retention_secs).unwrap_or(i64::MAX / 1_000),
        )
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(EngineError::Config {
                message: format!("unknown log format {}", other),
            }),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// =============================================================================
// Default Functions
// =============================================================================

fn default_lock_timeout_ms() -> u64 {
    2_000
}

fn default_anchor_max_leaves() -> usize {
    1_024
}

fn default_interval_secs() -> u64 {
    60
}

fn default_velocity_retention_secs() -> u64 {
    3_600
}

fn default_expectation_retention_secs() -> u64 {
    7 * 24 * 3_600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Validation
// =============================================================================

impl WardenConfig {
    /// Configuration with verbose logging for local runs and tests
    pub fn development() -> Self {
        Self {
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: LogFormat::Pretty,
            },
            ..Self::default()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(EngineError::Config {
                message: message.to_string(),
            })
        };

        if self.spend.lock_timeout_ms == 0 {
            return invalid("spend.lock_timeout_ms must be positive");
        }
        if let Some(limits) = self.spend.default_velocity {
            if limits.max_per_minute == 0 || limits.max_per_hour == 0 {
                return invalid("spend.default_velocity ceilings must be positive");
            }
        }
        if self.ledger.anchor_max_leaves == 0 {
            return invalid("ledger.anchor_max_leaves must be positive");
        }
        if self.maintenance.interval_secs == 0 {
            return invalid("maintenance.interval_secs must be positive");
        }
        // The hourly velocity check reads records up to an hour old
        if self.maintenance.velocity_retention_secs < 3_600 {
            return invalid("maintenance.velocity_retention_secs must be at least 3600");
        }
        if self.maintenance.expectation_retention_secs == 0 {
            return invalid("maintenance.expectation_retention_secs must be positive");
        }
        if self.reconciliation.ingest_retry.max_attempts == 0 {
            return invalid("reconciliation.ingest_retry.max_attempts must be positive");
        }
        if self.logging.level.trim().is_empty() {
            return invalid("logging.level must not be empty");
        }
        self.reconciliation.rules.validate()?;
        self.approval.ttls.validate()?;
        Ok(())
    }
}
