//! Configuration error model.

use thiserror::Error;

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration-level error.
///
/// Raised when a throttle or job definition is built with values that can
/// never work (empty key, zero slots, zero-length window). Runtime failures
/// belong to the store and job layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A throttle key was empty or otherwise unusable.
    #[error("invalid throttle key: {0}")]
    InvalidKey(String),

    /// A numeric option was out of range.
    #[error("invalid value for `{option}`: {reason}")]
    InvalidValue { option: &'static str, reason: String },

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ConfigError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn invalid_value(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            reason: reason.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
