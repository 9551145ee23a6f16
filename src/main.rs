//! mcp-relay - session-coordination relay for Streamable HTTP MCP servers.
//!
//! The standalone binary serves the bundled in-process reference upstream;
//! production deployments embed the library around their own MCP SDK.

use clap::{Parser, Subcommand};
use mcp_relay::upstream::LocalMcpServer;
use mcp_relay::{Config, RelayServer, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "mcp-relay")]
#[command(about = "Distributed session-coordination relay for MCP servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, env = "MCP_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCP_RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay in front of the bundled reference upstream
    Start {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            // CLI level wins when set; otherwise the config file decides.
            let level = if cli.log_level == "info" {
                config.observability.logging.level.clone()
            } else {
                cli.log_level.clone()
            };
            init_tracing(&level, &config.observability.logging.format);
            info!(
                backend = ?config.store.backend,
                path = %config.relay.path,
                "starting mcp-relay"
            );

            let upstream = Arc::new(LocalMcpServer::new());
            let server = RelayServer::new(config, upstream).await?;
            server.run().await
        }
        Commands::Validate { config } => {
            Config::validate_file(&config)?;
            println!("Configuration valid: {}", config.display());
            Ok(())
        }
    }
}
