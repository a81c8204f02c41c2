use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogConfig, TurnstileConfig};
use turnstile::RateLimiterBackend;

/// Check and manage rate limits from the command line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record attempts for a key and print each outcome
    Hit {
        key: String,
        /// Attempts admitted per window
        #[arg(short, long)]
        limit: u64,
        /// Number of attempts to record
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },
    /// Print the current state of a key without recording an attempt
    State {
        key: String,
        #[arg(short, long)]
        limit: u64,
    },
    /// Forget everything stored for a key
    Reset { key: String },
    /// Print the resolved limiter settings
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.log)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    debug!(storage = config.storage.kind(), "Configuration loaded");

    execute(cli.command, &config, &mut std::io::stdout().lock()).await
}

/// Run one command, printing results to `out`. Only commands that touch
/// stored state connect to the backend.
async fn execute(command: Command, config: &TurnstileConfig, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Command::Hit { key, limit, count } => {
            let limiter = connect(config).await?;
            for _ in 0..count {
                let state = limiter.update_state(&key, limit).await?;
                writeln!(out, "{}", serde_json::to_string(&state)?)?;
            }
        }
        Command::State { key, limit } => {
            let state = connect(config).await?.get_state(&key, limit).await?;
            writeln!(out, "{}", serde_json::to_string(&state)?)?;
        }
        Command::Reset { key } => {
            connect(config).await?.reset(&key).await?;
            info!(key = %key, "Key reset");
        }
        Command::Settings => {
            let settings = serde_json::json!({
                "policy": config.policy.resolve()?.to_settings().to_transport()?,
                "backoff": config.backoff.resolve()?.to_settings().to_transport()?,
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&settings)?)?;
        }
    }
    Ok(())
}

async fn connect(config: &TurnstileConfig) -> anyhow::Result<Box<dyn RateLimiterBackend>> {
    config
        .build_backend()
        .await
        .context("Failed to initialize rate limiter")
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
/// Logs go to stderr so stdout carries only command output.
fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
