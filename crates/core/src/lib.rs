#![warn(clippy::unwrap_used)]

pub mod config;
pub mod content;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use content::{GenerationRequest, NormalizedInput};
pub use error::{InboxError, InboxResult};
