use thiserror::Error;

pub type InboxResult<T> = Result<T, InboxError>;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Experiment inactive: {0}")]
    ExperimentInactive(String),

    #[error("Variant not found: {0}")]
    VariantNotFound(String),

    #[error("Generation timed out after {attempts} attempts")]
    GatewayTimeout { attempts: u32 },

    #[error("Generation rate limited after {attempts} attempts")]
    GatewayRateLimited { attempts: u32 },

    #[error("Generation provider error: {0}")]
    GatewayUpstream(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Experiment store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl InboxError {
    /// Whether the caller may usefully retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InboxError::GatewayTimeout { .. }
                | InboxError::GatewayRateLimited { .. }
                | InboxError::GatewayUpstream(_)
                | InboxError::Store(_)
                | InboxError::Io(_)
        )
    }
}
