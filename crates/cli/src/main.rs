//! llm-router CLI — the main entry point.
//!
//! Commands:
//! - `serve`     — Start the gateway HTTP server
//! - `check`     — Validate configuration and provider wiring
//! - `providers` — List the dialects this build can speak

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llmrouter_config::AppConfig;

#[derive(Parser)]
#[command(
    name = "llm-router",
    about = "Multi-provider LLM gateway: one endpoint, intelligent routing, your own keys.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway HTTP server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the host (e.g. 0.0.0.0 for Docker)
        #[arg(long)]
        host: Option<String>,
    },

    /// Validate configuration and report provider wiring
    Check,

    /// List the provider dialects this build supports
    Providers,
}

fn load_config(path: Option<&str>) -> anyhow::Result<AppConfig> {
    Ok(match path {
        Some(p) => AppConfig::load(p)?,
        None => AppConfig::from_env()?,
    })
}

fn init_tracing(config: &AppConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.0.clone()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => {
            let mut config = load_config(cli.config.as_deref())?;
            init_tracing(&config, cli.verbose);
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            llmrouter_gateway::start(config)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }

        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config, cli.verbose);

            println!("configuration: ok");
            println!("  server        {}:{}", config.server.host, config.server.port);
            println!("  strategy      {}", config.routing.default_strategy);
            println!(
                "  cache         {} (ttl {}s, max {})",
                if config.cache.enabled { "enabled" } else { "disabled" },
                config.cache.ttl_seconds,
                config.cache.max_size
            );
            if config.auth.jwt_secret.is_none() {
                println!("  warning: JWT_SECRET is not set; `serve` will refuse to start");
            }
            if config.providers.is_empty() {
                println!("  warning: no providers configured");
            }
            for (id, provider) in &config.providers {
                let credentialed = provider.api_key.is_some()
                    || provider.aws_access_key_id.is_some()
                    || provider.credentials_file.is_some();
                println!(
                    "  provider {id:20} dialect {:?}, {} models, credentials {}",
                    provider.dialect,
                    provider.models.len(),
                    if credentialed { "present" } else { "MISSING" }
                );
            }
        }

        Commands::Providers => {
            for dialect in [
                "openai_chat",
                "anthropic_messages",
                "azure_openai",
                "bedrock_invoke",
                "vertex_predict",
                "mistral",
                "together",
                "fireworks",
                "groq",
                "cohere_chat",
                "cohere_embed",
                "cohere_rerank",
                "openrouter",
                "huggingface",
                "gguf_local",
            ] {
                println!("{dialect}");
            }
        }
    }

    Ok(())
}
