//! The `baton` binary.

mod config;
mod runtime;

use anyhow::Context;
use baton_api::{ApiServer, ApiState, AuthConfig};
use baton_ledger::TaskLedger;
use baton_orchestrator::ZombieReaper;
use clap::{Parser, Subcommand, ValueEnum};
use config::BatonConfig;
use runtime::Runtime;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "baton", version, about = "Baton: multi-agent task orchestration and protocol gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "BATON_CONFIG", default_value = "baton.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, env = "BATON_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, the reaper and the HTTP API
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Prune persisted sessions past retention and exit
    Sweep,
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config file and print the effective settings
    Check,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = BatonConfig::load(&cli.config).await?;
    config.validate()?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await?,
        Commands::Sweep => sweep(config).await?,
        Commands::Config {
            action: ConfigAction::Check,
        } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("\nConfig '{}' is valid.", cli.config.display());
        }
    }

    Ok(())
}

async fn serve(config: BatonConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create data dir '{}'", config.data_dir.display()))?;
    let runtime = Runtime::build(&config).await?;

    let auth = AuthConfig::new(config.api.api_keys.clone());
    if auth.is_enabled() {
        info!(keys = config.api.api_keys.len(), "API key auth enabled");
    }
    let state = Arc::new(ApiState {
        dispatcher: runtime.dispatcher.clone(),
        governor: runtime.governor.clone(),
        reaper: runtime.reaper.clone(),
    });
    let app = ApiServer::build_with_auth(state, auth);

    let host = host.unwrap_or(config.api.host);
    let port = port.unwrap_or(config.api.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let cancel = CancellationToken::new();
    let mut loops = JoinSet::new();
    loops.spawn(runtime.dispatcher.clone().run(cancel.clone()));
    loops.spawn(runtime.reaper.clone().run(cancel.clone()));
    let mut server = tokio::spawn(ApiServer::serve(listener, app, cancel.clone()));
    info!(%addr, "Baton started");

    let early = tokio::select! {
        joined = &mut server => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            None
        }
    };
    cancel.cancel();
    let served = match early {
        Some(joined) => joined,
        None => server.await,
    };
    while let Some(joined) = loops.join_next().await {
        joined?;
    }
    served??;
    info!("Baton stopped");
    Ok(())
}

async fn sweep(config: BatonConfig) -> anyhow::Result<()> {
    let sessions = runtime::session_store(&config).await?;
    let reaper = ZombieReaper::new(Arc::new(TaskLedger::new()), sessions, config.reaper_config());
    let stats = reaper.sweep_retention().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
