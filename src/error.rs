//! Classified errors shared by every provider.
//!
//! The variants mirror how callers are expected to react: validation and
//! authentication failures are terminal, rate limits and transient network
//! failures may be retried, and timeouts carry the last state observed so an
//! operator can tell a slow provider from a stuck one.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by providers and by the request and polling helpers they
/// compose.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when provider credentials or settings are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when an instance configuration is malformed. Never retried.
    #[error("invalid instance config: {0}")]
    Validation(String),
    /// Raised when the provider rejects the supplied credentials.
    #[error("authentication rejected (status {status}): {message}")]
    Authentication {
        /// HTTP status returned by the provider.
        status: u16,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the provider kept throttling until the retry budget ran
    /// out.
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimited {
        /// Number of attempts made.
        attempts: u32,
        /// Last message returned by the provider.
        message: String,
    },
    /// Raised when a resource the caller named does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// Raised when the transport or the provider failed transiently on every
    /// attempt.
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient {
        /// Number of attempts made.
        attempts: u32,
        /// Last transport or provider message.
        message: String,
    },
    /// Raised when polling exhausted its attempts without success.
    #[error("timeout waiting for {action} after {attempts} attempts (last state: {last_state})")]
    Timeout {
        /// Condition being waited on.
        action: String,
        /// Number of evaluations made.
        attempts: u32,
        /// Last state reported before giving up.
        last_state: String,
    },
    /// Raised when the caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// Raised when an instance remains listed after deletion.
    #[error("instance {name} still exists in {region} after {attempts} checks")]
    StillExists {
        /// Instance name.
        name: String,
        /// Region the instance lives in.
        region: String,
        /// Number of absence checks made.
        attempts: u32,
    },
    /// Raised for terminal, unclassified provider responses.
    #[error("provider returned status {status}: {message}")]
    Api {
        /// HTTP status returned by the provider.
        status: u16,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when a provider payload cannot be decoded.
    #[error("failed to decode {context}: {message}")]
    Decode {
        /// What was being decoded.
        context: String,
        /// Decoder message.
        message: String,
    },
}

impl ProviderError {
    /// Returns `true` when repeating the whole operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` when the operation stopped because it was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` when a failure for one instance must end the whole
    /// request instead of dropping that instance from the result.
    #[must_use]
    pub const fn aborts_request(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Cancelled | Self::Config(_) | Self::Validation(_)
        )
    }

    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub(crate) fn decode(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

impl From<ConfigError> for ProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
