//! Momentum trader - main entry point
//!
//! Orchestrator commands (start, stop, restart, status, monitor) plus one
//! `run-*` subcommand per service so each can be launched standalone for
//! debugging against its own state directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use momentum_trader::broker::AlpacaClient;
use momentum_trader::config::Config;
use momentum_trader::orchestrator::Orchestrator;
use momentum_trader::services::{Buyer, Monitor, PreMarketScanner, Scanner, Seller};
use momentum_trader::state::StateDir;

#[derive(Parser, Debug)]
#[command(name = "momentum-trader")]
#[command(about = "Intraday momentum trading services: watchlist, signals, execution, risk", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Shared state directory
    #[arg(long, global = true, default_value = "state")]
    state_dir: PathBuf,

    /// Optional JSON config file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all services and supervise them
    Start,

    /// Gracefully stop all running services
    Stop,

    /// Stop then start all services
    Restart,

    /// Report per-service health
    Status,

    /// Start all services and auto-restart any that crash
    Monitor,

    /// Run the pre-market watchlist scan once
    RunPremarket {
        /// Rebuild the watchlist even if one exists for today
        #[arg(long)]
        force: bool,
    },

    /// Run the signal scanner standalone
    RunScanner,

    /// Run the buyer standalone
    RunBuyer,

    /// Run the position monitor standalone
    RunMonitor,

    /// Run the seller standalone
    RunSeller,
}

fn setup_logging(name: &str, verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", format!("{name}.log"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Shutdown flag flipped by Ctrl+C or SIGTERM
fn shutdown_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));

    let ctrl_c_flag = flag.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received - shutting down gracefully");
        ctrl_c_flag.store(true, Ordering::Relaxed);
    });

    #[cfg(unix)]
    {
        let term_flag = flag.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                info!("SIGTERM received - shutting down gracefully");
                term_flag.store(true, Ordering::Relaxed);
            }
        });
    }

    flag
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_name = match &cli.command {
        Commands::Start | Commands::Stop | Commands::Restart | Commands::Status | Commands::Monitor => {
            "orchestrator"
        }
        Commands::RunPremarket { .. } => "premarket",
        Commands::RunScanner => "scanner",
        Commands::RunBuyer => "buyer",
        Commands::RunMonitor => "monitor",
        Commands::RunSeller => "seller",
    };
    setup_logging(log_name, cli.verbose)?;

    let config = Config::load(cli.config.as_deref())?;
    let state = StateDir::new(&cli.state_dir)?;

    match cli.command {
        Commands::Start => {
            let mut orch = Orchestrator::new(config, state);
            orch.start_all()?;
            orch.supervise(false, shutdown_flag()).await
        }
        Commands::Stop => {
            let mut orch = Orchestrator::new(config, state);
            orch.stop_all()
        }
        Commands::Restart => {
            let mut orch = Orchestrator::new(config, state);
            orch.stop_all()?;
            orch.start_all()?;
            orch.supervise(false, shutdown_flag()).await
        }
        Commands::Status => {
            let mut orch = Orchestrator::new(config, state);
            orch.status()?;
            Ok(())
        }
        Commands::Monitor => {
            let mut orch = Orchestrator::new(config, state);
            orch.start_all()?;
            orch.supervise(true, shutdown_flag()).await
        }
        Commands::RunPremarket { force } => {
            let broker =
                AlpacaClient::connect(&config.broker, config.universe.api_budget_per_min).await?;
            let scanner = PreMarketScanner::new(config, state, Arc::new(broker));
            scanner.run_service(force).await
        }
        Commands::RunScanner => {
            let broker =
                AlpacaClient::connect(&config.broker, config.scanner.api_budget_per_min).await?;
            let scanner = Scanner::new(config, state, Arc::new(broker));
            scanner.run_continuous(shutdown_flag()).await
        }
        Commands::RunBuyer => {
            let broker =
                AlpacaClient::connect(&config.broker, config.buyer.api_budget_per_min).await?;
            let mut buyer = Buyer::new(config, state, Arc::new(broker));
            buyer.run_continuous(shutdown_flag()).await
        }
        Commands::RunMonitor => {
            let broker =
                AlpacaClient::connect(&config.broker, config.monitor.api_budget_per_min).await?;
            let monitor = Monitor::new(config, state, Arc::new(broker));
            monitor.run_continuous(shutdown_flag()).await
        }
        Commands::RunSeller => {
            let broker =
                AlpacaClient::connect(&config.broker, config.seller.api_budget_per_min).await?;
            let mut seller = Seller::new(config, state, Arc::new(broker));
            seller.run_continuous(shutdown_flag()).await
        }
    }
}
