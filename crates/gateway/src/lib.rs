//! Resilient generation gateway: one upstream call to a text-generation
//! provider, wrapped in timeout, exponential backoff with jitter, and
//! cancellation.

#![warn(clippy::unwrap_used)]

pub mod error;
pub mod gateway;
pub mod prompt;
pub mod provider;
pub mod retry;

pub use error::{GatewayError, ProviderError};
pub use gateway::{CallContext, GeneratedVariants, GenerationGateway};
pub use provider::{
    provider_from_config, AnthropicProvider, GenerationProvider, OfflineProvider, OpenAiProvider,
};
pub use retry::RetryPolicy;
