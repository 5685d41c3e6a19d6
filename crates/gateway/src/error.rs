use inbox_core::InboxError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single provider call.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out")]
    Timeout,

    /// The provider refused the request (bad key, bad payload); retrying won't help.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected(_))
    }
}

/// Terminal gateway outcome once the retry policy gives up.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("upstream failure after {attempts} attempts: {message}")]
    Upstream { attempts: u32, message: String },

    #[error("generation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl GatewayError {
    /// Classify the last provider error once attempts are exhausted.
    pub(crate) fn exhausted(last: ProviderError, attempts: u32) -> Self {
        match last {
            ProviderError::RateLimited { .. } => GatewayError::RateLimited { attempts },
            ProviderError::Timeout => GatewayError::Timeout { attempts },
            other => GatewayError::Upstream {
                attempts,
                message: other.to_string(),
            },
        }
    }
}

impl From<GatewayError> for InboxError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::RateLimited { attempts } => InboxError::GatewayRateLimited { attempts },
            GatewayError::Timeout { attempts } => InboxError::GatewayTimeout { attempts },
            GatewayError::Upstream { message, .. } => InboxError::GatewayUpstream(message),
            GatewayError::Cancelled { .. } => InboxError::Cancelled,
        }
    }
}
