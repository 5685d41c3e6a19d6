use serde::Deserialize;
use std::path::Path;

/// Root application configuration. Loaded from an optional TOML file layered
/// under environment variables with the prefix `INBOX_LAB__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis URL. When unset or unreachable at startup the network tier is skipped.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on any single backend call before it is treated as a miss.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
    /// Directory for the on-disk fallback tier. `None` disables it.
    #[serde(default = "default_disk_dir")]
    pub disk_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Offline,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "offline" => Ok(ProviderKind::Offline),
            other => Err(format!("unknown provider '{other}' (expected openai, anthropic or offline)")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for the provider's base URL (proxies, test doubles).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    /// Total serves across an experiment before Thompson sampling takes over.
    #[serde(default = "default_exploration_threshold")]
    pub exploration_threshold: u64,
    #[serde(default = "default_z_score")]
    pub z_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON-lines journal. `None` keeps the store purely in memory.
    #[serde(default = "default_journal_path")]
    pub journal_path: Option<String>,
    /// Caller-supplied event ids remembered per experiment for retries.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "inbox-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_op_timeout_ms() -> u64 {
    250
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_local_max_entries() -> usize {
    100_000
}
fn default_disk_dir() -> Option<String> {
    Some("./data/cache".to_string())
}
fn default_provider() -> ProviderKind {
    ProviderKind::OpenAi
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_temperature() -> f32 {
    0.85
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}
fn default_max_variants() -> usize {
    5
}
fn default_max_length() -> usize {
    60
}
fn default_exploration_threshold() -> u64 {
    5000
}
fn default_z_score() -> f64 {
    1.96
}
fn default_journal_path() -> Option<String> {
    Some("./data/journal.jsonl".to_string())
}
fn default_dedupe_window() -> usize {
    65_536
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_ttl_secs(),
            op_timeout_ms: default_op_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            local_max_entries: default_local_max_entries(),
            disk_dir: default_disk_dir(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            endpoint: None,
            call_timeout_ms: default_call_timeout_ms(),
            temperature: default_temperature(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_variants: default_max_variants(),
            max_length: default_max_length(),
        }
    }
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_threshold: default_exploration_threshold(),
            z_score: default_z_score(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            gateway: GatewayConfig::default(),
            generation: GenerationDefaults::default(),
            bandit: BanditConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, with environment
    /// variables taking precedence.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        tracing::debug!(path = ?path, "Loading configuration");

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("INBOX_LAB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.bandit.exploration_threshold, 5000);
        assert_eq!(config.generation.max_variants, 5);
        assert_eq!(config.generation.max_length, 60);
        assert_eq!(config.gateway.retry.max_attempts, 5);
        assert_eq!(config.gateway.retry.multiplier, 2.0);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.gateway.provider, ProviderKind::OpenAi);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
node_id = "inbox-test"

[gateway]
provider = "offline"

[gateway.retry]
max_attempts = 3

[bandit]
exploration_threshold = 30
"#
        )
        .unwrap();

        let config = AppConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "inbox-test");
        assert_eq!(config.gateway.provider, ProviderKind::Offline);
        assert_eq!(config.gateway.retry.max_attempts, 3);
        assert_eq!(config.gateway.retry.base_delay_ms, 1000);
        assert_eq!(config.bandit.exploration_threshold, 30);
        assert_eq!(config.api.http_port, 8080);
    }
}
