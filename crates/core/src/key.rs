//! Throttle keys and the store key layout derived from them.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default namespace for every key written to the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "jobthrottle";

/// Name of a throttled logical resource (e.g. a downstream API endpoint).
///
/// All callers that must share a limit have to use the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThrottleKey(String);

impl ThrottleKey {
    /// Build a key, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> ConfigResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::invalid_key("key must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid_key(format!(
                "key must not contain whitespace: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the `index`-th concurrency slot.
    pub fn slot_key(&self, prefix: &str, index: u32) -> String {
        format!("{prefix}:concurrency:{}:slot:{index}", self.0)
    }

    /// Store key of the exception window counter.
    pub fn exception_counter_key(&self, prefix: &str) -> String {
        format!("{prefix}:exceptions:{}", self.0)
    }
}

impl core::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ThrottleKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ThrottleKey {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ThrottleKey> for String {
    fn from(value: ThrottleKey) -> Self {
        value.0
    }
}
