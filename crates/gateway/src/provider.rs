//! Text-generation providers.
//!
//! Every backend implements [`GenerationProvider`]; the gateway is handed one
//! at construction and never chooses a provider itself.

use crate::error::ProviderError;
use crate::prompt::Prompt;
use async_trait::async_trait;
use inbox_core::config::{GatewayConfig, ProviderKind};
use inbox_core::{InboxError, InboxResult};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 300;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name for metrics/logging.
    fn provider_name(&self) -> &str;

    /// Run one completion and return the raw text.
    async fn generate_raw(&self, prompt: &Prompt) -> Result<String, ProviderError>;
}

/// Build the provider named in configuration.
pub fn provider_from_config(config: &GatewayConfig) -> InboxResult<Arc<dyn GenerationProvider>> {
    let provider: Arc<dyn GenerationProvider> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        ProviderKind::Offline => Arc::new(OfflineProvider),
    };
    Ok(provider)
}

fn http_client(config: &GatewayConfig) -> InboxResult<reqwest::Client> {
    reqwest::Client::builder()
        // The gateway enforces the per-attempt bound; this only guards stuck sockets.
        .timeout(Duration::from_millis(config.call_timeout_ms.saturating_mul(2)))
        .build()
        .map_err(|e| InboxError::Config(format!("HTTP client: {e}")))
}

fn require_key(config: &GatewayConfig, provider: &str) -> InboxResult<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| InboxError::Config(format!("{provider} provider requires gateway.api_key")))
}

/// Map a non-success HTTP status to a provider error.
fn classify_status(status: StatusCode, headers: &header::HeaderMap, body: &str) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return ProviderError::RateLimited { retry_after };
    }
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ProviderError::Unavailable(format!("HTTP {status}: {snippet}"))
    } else {
        ProviderError::Rejected(format!("HTTP {status}: {snippet}"))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

async fn send_json(request: reqwest::RequestBuilder) -> Result<String, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(classify_status(status, &headers, &body));
    }
    Ok(body)
}

// ─── OpenAI ─────────────────────────────────────────────────────────────

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(config: &GatewayConfig) -> InboxResult<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: require_key(config, "openai")?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            base_url: config
                .endpoint
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            temperature: config.temperature,
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn generate_raw(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        debug!(model = %self.model, "Requesting OpenAI chat completion");
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": prompt.system},
                    {"role": "user", "content": prompt.user},
                ],
                "temperature": self.temperature,
                "max_tokens": MAX_OUTPUT_TOKENS,
            }));

        let body = send_json(request).await?;
        let completion: ChatCompletion =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("no completion choices".to_string()))
    }
}

// ─── Anthropic ──────────────────────────────────────────────────────────

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(config: &GatewayConfig) -> InboxResult<Self> {
        Ok(Self {
            client: http_client(config)?,
            api_key: require_key(config, "anthropic")?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
            base_url: config
                .endpoint
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            temperature: config.temperature,
        })
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn generate_raw(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        debug!(model = %self.model, "Requesting Anthropic message");
        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "system": prompt.system,
                "messages": [{"role": "user", "content": prompt.user}],
                "temperature": self.temperature,
                "max_tokens": MAX_OUTPUT_TOKENS,
            }));

        let body = send_json(request).await?;
        let message: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let text: Vec<String> = message
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Malformed("no text content blocks".to_string()));
        }
        Ok(text.join("\n"))
    }
}

// ─── Offline ────────────────────────────────────────────────────────────

/// Deterministic, network-free provider for local development. Builds
/// subject lines from the opening words of the email body in the prompt.
pub struct OfflineProvider;

const OFFLINE_TEMPLATES: &[&str] = &[
    "Inside: {}",
    "Don't miss: {}",
    "{} (just for you)",
    "Last chance: {}",
    "Quick look: {}",
    "New for you: {}",
    "You asked, we listened: {}",
    "Here's what's new: {}",
    "Before it's gone: {}",
    "A quick note: {}",
];

impl OfflineProvider {
    fn topic(prompt: &Prompt) -> String {
        let body = prompt
            .user
            .split_once("Email content:\n")
            .map(|(_, rest)| rest)
            .unwrap_or(&prompt.user);
        let first_line = body.lines().next().unwrap_or_default();
        let words: Vec<&str> = first_line
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .take(4)
            .collect();
        if words.is_empty() {
            "our latest update".to_string()
        } else {
            words.join(" ")
        }
    }
}

#[async_trait]
impl GenerationProvider for OfflineProvider {
    fn provider_name(&self) -> &str {
        "offline"
    }

    async fn generate_raw(&self, prompt: &Prompt) -> Result<String, ProviderError> {
        let topic = Self::topic(prompt);
        Ok(OFFLINE_TEMPLATES
            .iter()
            .enumerate()
            .map(|(i, template)| format!("{}. {}\n", i + 1, template.replace("{}", &topic)))
            .collect())
    }
}
