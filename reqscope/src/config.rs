//! Session configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty object (or
//! no file at all) gives the stock behaviour.
//!
//! ```json
//! {
//!   "sanity_slop_ms": 10000,
//!   "max_chunk_bytes": 0,
//!   "headers": [
//!     { "action": "set", "name": "User-Agent", "value": "reqscope" },
//!     { "action": "add", "name": "X-Test", "value": "1", "host": "example.com" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::ConfigError;

/// Default tolerance around the run window for application-reported timings
pub const DEFAULT_SANITY_SLOP_MS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReqscopeConfig {
    /// Synthesized requests must fall within the run window widened by this
    /// many milliseconds on each side
    pub sanity_slop_ms: i64,

    /// Captured chunks are truncated to this many bytes before being stored
    /// (0 = keep everything)
    pub max_chunk_bytes: usize,

    /// Header injection rules applied to the first outbound chunk of each
    /// HTTP request
    pub headers: Vec<HeaderRule>,
}

impl Default for ReqscopeConfig {
    fn default() -> Self {
        Self { sanity_slop_ms: DEFAULT_SANITY_SLOP_MS, max_chunk_bytes: 0, headers: Vec::new() }
    }
}

impl ReqscopeConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON for this
    /// schema, or fails validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&content)
    }

    /// Parse and validate a config from JSON text
    ///
    /// # Errors
    /// Returns an error if the text does not match the schema or fails
    /// validation
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot express constraints for
    ///
    /// # Errors
    /// Returns the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sanity_slop_ms <= 0 {
            return Err(ConfigError::InvalidSlop(self.sanity_slop_ms));
        }
        if self.headers.iter().any(|rule| rule.name.trim().is_empty()) {
            return Err(ConfigError::EmptyHeaderName);
        }
        Ok(())
    }
}

/// What a header rule does to an existing header of the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    /// Replace every existing header with this name
    Set,
    /// Append, keeping existing headers
    Add,
}

/// One header injection rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub action: HeaderAction,
    pub name: String,
    pub value: String,
    /// Only apply to requests whose `Host` header matches (case-insensitive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl HeaderRule {
    /// Returns true if this rule applies to a request for `host`
    #[must_use]
    pub fn applies_to(&self, host: Option<&str>) -> bool {
        match (&self.host, host) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        }
    }
}
