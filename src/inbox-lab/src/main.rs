//! Inbox Lab: AI-generated subject lines run as bandit experiments.
//!
//! Main entry point that initializes all subsystems and starts the server.

use anyhow::Context;
use clap::Parser;
use inbox_api::ApiServer;
use inbox_core::config::{AppConfig, ProviderKind};
use inbox_engine::ExperimentPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "inbox-lab")]
#[command(about = "Email subject-line generation with adaptive bandit experiments")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "INBOX_LAB_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port (overrides config)
    #[arg(long, env = "INBOX_LAB__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Generation provider: openai, anthropic or offline (overrides config)
    #[arg(long, env = "INBOX_LAB__GATEWAY__PROVIDER")]
    provider: Option<ProviderKind>,

    /// Experiment journal path (overrides config)
    #[arg(long, env = "INBOX_LAB__STORE__JOURNAL_PATH")]
    journal: Option<String>,

    /// Keep experiments in memory only
    #[arg(long, default_value_t = false, conflicts_with = "journal")]
    no_journal: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(Some(path.as_path()))
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(provider) = cli.provider {
        config.gateway.provider = provider;
    }
    if let Some(journal) = &cli.journal {
        config.store.journal_path = Some(journal.clone());
    }
    if cli.no_journal {
        config.store.journal_path = None;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inbox_lab=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Inbox Lab starting up");

    let config = load_config(&cli)?;

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        provider = ?config.gateway.provider,
        journal = ?config.store.journal_path,
        redis = config.cache.redis_url.is_some(),
        "Configuration loaded"
    );

    let pipeline = Arc::new(
        ExperimentPipeline::from_config(&config)
            .await
            .context("initializing experiment pipeline")?,
    );

    let api_server = ApiServer::new(config.clone(), pipeline.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn cache maintenance task
    let pipeline_for_maintenance = pipeline.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = pipeline_for_maintenance.cache_maintenance().await;
            debug!(evicted = evicted, "Cache maintenance pass");
        }
    });

    info!("Inbox Lab is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
