//! parley binary: runs the voice gateway and a few operator helpers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley::config::Config;
use parley::gateway::auth::CredentialAuthority;

/// Real-time, turn-based voice conversation gateway.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about, long_about = None)]
struct Cli {
    /// Config file (default: platform config dir, or $PARLEY_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Bind address (overrides [gateway] host)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides [gateway] port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Mint a short-lived connect credential for a session id
    Token {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the JSON schema of config.toml
    Schema,
    /// Print the effective configuration (secrets redacted)
    Show,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = Config::load(path).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);
    tracing::debug!(path = %config.config_path.display(), "Configuration loaded");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            parley::gateway::run_gateway(config).await
        }
        Commands::Token { session_id } => {
            let config = load_config(cli.config.as_deref())?;
            let Some(secret) = config.auth.credential_secret.as_deref() else {
                bail!(
                    "auth.credential_secret is not configured; the gateway would not accept \
                     a token minted here. Set it in config.toml or PARLEY_CREDENTIAL_SECRET."
                );
            };
            parley::gateway::auth::validate_session_id(&session_id)
                .map_err(|reason| anyhow::anyhow!("Invalid session id: {reason}"))?;
            let authority = CredentialAuthority::new(
                secret,
                Duration::from_secs(config.auth.credential_ttl_secs),
            );
            println!("{}", authority.issue(&session_id)?);
            Ok(())
        }
        Commands::Config {
            command: ConfigCommand::Schema,
        } => {
            println!("{}", Config::json_schema()?);
            Ok(())
        }
        Commands::Config {
            command: ConfigCommand::Show,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if config.auth.credential_secret.is_some() {
                config.auth.credential_secret = Some("***".into());
            }
            if config.upstream.api_key.is_some() {
                config.upstream.api_key = Some("***".into());
            }
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
