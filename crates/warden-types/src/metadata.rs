//! Bounded metadata attached to spends, payments and approvals

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of extension keys
pub const MAX_EXTENSION_KEYS: usize = 16;
/// Maximum extension key length in bytes
pub const MAX_EXTENSION_KEY_BYTES: usize = 64;
/// Maximum extension value length in bytes
pub const MAX_EXTENSION_VALUE_BYTES: usize = 256;

/// Known metadata fields plus one bounded extension map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extensions: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_merchant_category(mut self, category: impl Into<String>) -> Self {
        self.merchant_category = Some(category.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Insert an extension value, enforcing the size bounds
    pub fn insert_extension(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || key.len() > MAX_EXTENSION_KEY_BYTES {
            return Err(WardenError::invalid_input(
                "metadata.extensions",
                format!("key must be 1 to {} bytes", MAX_EXTENSION_KEY_BYTES),
            ));
        }
        if value.len() > MAX_EXTENSION_VALUE_BYTES {
            return Err(WardenError::invalid_input(
                "metadata.extensions",
                format!("value for {} exceeds {} bytes", key, MAX_EXTENSION_VALUE_BYTES),
            ));
        }
        if !self.extensions.contains_key(&key) && self.extensions.len() >= MAX_EXTENSION_KEYS {
            return Err(WardenError::invalid_input(
                "metadata.extensions",
                format!("at most {} keys allowed", MAX_EXTENSION_KEYS),
            ));
        }
        self.extensions.insert(key, value);
        Ok(())
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    /// Re-check bounds, used on metadata that arrived through deserialization
    pub fn validate(&self) -> Result<()> {
        if self.extensions.len() > MAX_EXTENSION_KEYS {
            return Err(WardenError::invalid_input(
                "metadata.extensions",
                format!("at most {} keys allowed", MAX_EXTENSION_KEYS),
            ));
        }
        for (key, value) in &self.extensions {
            if key.is_empty()
                || key.len() > MAX_EXTENSION_KEY_BYTES
                || value.len() > MAX_EXTENSION_VALUE_BYTES
            {
                return Err(WardenError::invalid_input(
                    "metadata.extensions",
                    format!("entry {} exceeds size bounds", key),
                ));
            }
        }
        Ok(())
    }
}
