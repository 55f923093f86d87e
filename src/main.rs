use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rebalancer::config::AppConfig;
use rebalancer::domain::RoleLimits;
use rebalancer::engine::{Coordinator, Engine, Reconciler};
use rebalancer::error::Result;
use rebalancer::store::{PgRequestStore, RequestStore};
use rebalancer::workers::{HttpWorkerClient, StaticRoleLimits};

#[derive(Parser)]
#[command(name = "rebalancer", about = "Portfolio rebalance coordination engine")]
struct Cli {
    /// Configuration directory (default.toml + <env>.toml)
    #[arg(long, default_value = "config", env = "REBALANCER_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator, reconciler, and action API
    Serve,
    /// Run database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let store =
                PgRequestStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let store =
        PgRequestStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;

    let workers = Arc::new(HttpWorkerClient::new(config.workers.clone())?);
    let engine = Arc::new(Engine {
        store: Arc::new(store) as Arc<dyn RequestStore>,
        analysis: workers.clone(),
        scorer: workers.clone(),
        synthesizer: workers,
        roles: Arc::new(StaticRoleLimits::new(RoleLimits {
            max_tickers: config.role_limits.max_tickers,
            rebalance_access: config.role_limits.rebalance_access,
            opportunity_agent_access: config.role_limits.opportunity_agent_access,
        })),
        config: config.engine.clone(),
        defaults: config.defaults.clone(),
    });

    let coordinator = Coordinator::new(engine);
    let reconciler = Reconciler::new(coordinator.clone(), &config.engine).spawn();

    let api = tokio::spawn(rebalancer::api::start_api_server(
        coordinator,
        config.api.port,
    ));

    info!("rebalancer running; ctrl-c to stop");
    signal::ctrl_c().await?;
    info!("shutdown signal received");

    reconciler.abort();
    api.abort();
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rebalancer=debug,sqlx=warn"));

    let log_dir = std::env::var("REBALANCER_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/rebalancer".to_string());

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so preflight writability before installing the layer.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".rebalancer_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "rebalancer.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // warn-level probe so a misconfigured filter is visible early
    warn!(log_dir = %log_dir, "logging initialized");
}
