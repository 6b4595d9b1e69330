#![warn(clippy::all)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use compare_common::config::{config_path, Config};
use compare_common::logging::init_logging_with_exclusions;
use compare_common::util::parse_duration_secs;
use compare_core::{
    open_store, Clock, DispatchPolicy, ProviderCatalog, SessionController, SystemClock, TokenLedger,
};

mod render;
mod repl;

/// Run one conversation against several models side by side.
#[derive(Parser, Debug)]
#[command(name = "chat-compare")]
#[command(version)]
#[command(about = "Compare chat models side by side with per-model token budgets.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.chatcompare/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured models and their token budgets
    Providers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start an interactive comparison session
    Chat {
        /// Model that opens the session
        #[arg(short, long)]
        provider: String,

        /// Additional models to bring in right away
        #[arg(long = "with", value_name = "ID")]
        with: Vec<String>,

        /// Replenishment sweep period, e.g. "60s" or "5m" (default from config)
        #[arg(long, value_name = "DURATION")]
        sweep_every: Option<String>,
    },

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return init_config(cli.config.as_deref(), *force);
    }

    let config = Config::load_and_validate(cli.config.as_deref())?;
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "chat-compare starting");

    match cli.command {
        Commands::Init { .. } => unreachable!(),
        Commands::Providers { json } => list_providers(&config, json),
        Commands::Chat {
            provider,
            with,
            sweep_every,
        } => chat(&config, &provider, &with, sweep_every.as_deref()).await,
    }
}

fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default()
        .save_to(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn open_ledger(config: &Config, catalog: &ProviderCatalog, clock: &dyn Clock) -> Result<TokenLedger> {
    let store = open_store(&config.persistence).context("Failed to open ledger store")?;
    Ok(TokenLedger::from_catalog(catalog, store, clock.now()))
}

fn list_providers(config: &Config, json: bool) -> Result<()> {
    let catalog = ProviderCatalog::from_config(config)?;
    let clock = SystemClock;
    let mut ledger = open_ledger(config, &catalog, &clock)?;

    let rows = render::provider_rows(&catalog, &mut ledger, clock.now());

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{}", row.to_line());
        }
    }
    Ok(())
}

async fn chat(config: &Config, provider: &str, with: &[String], sweep_every: Option<&str>) -> Result<()> {
    let catalog = ProviderCatalog::from_config(config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = open_ledger(config, &catalog, clock.as_ref())?;

    let session = SessionController::start(
        catalog,
        ledger,
        clock,
        DispatchPolicy::from_config(config),
        provider,
    )?;
    for id in with {
        session.add_provider(id)?;
    }

    let sweep_secs = match sweep_every {
        Some(raw) => parse_duration_secs(raw).map_err(|e| anyhow!("Invalid --sweep-every: {e}"))?,
        None => config.session.replenish_sweep_secs,
    };
    if sweep_secs == 0 {
        bail!("Sweep period must be greater than zero");
    }
    let sweep = session.spawn_replenish_sweep(Duration::from_secs(sweep_secs));

    tracing::info!(provider = %provider, sweep_secs, "Chat session open");
    repl::run(session).await?;

    sweep.abort();
    Ok(())
}
