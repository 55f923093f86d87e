use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub defaults: ConstraintDefaults,
    pub workers: WorkerConfig,
    #[serde(default)]
    pub role_limits: RoleLimitsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Timeout for a synchronous opportunity-scoring call, in seconds
    #[serde(default = "default_opportunity_timeout")]
    pub opportunity_timeout_secs: u64,
    /// Timeout for a single analysis dispatch call, in seconds
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    /// Interval between reconciliation sweeps, in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// A request with no activity for this long is eligible for stale-job cleanup
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,
    /// Capacity of each per-request mailbox
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_opportunity_timeout() -> u64 {
    30
}

fn default_dispatch_timeout() -> u64 {
    15
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_staleness_window() -> u64 {
    900
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opportunity_timeout_secs: default_opportunity_timeout(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            staleness_window_secs: default_staleness_window(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

/// Defaults applied when a request omits an optional constraint
#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintDefaults {
    /// Allocation drift (percent) above which a full analysis is forced
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: Decimal,
    /// Minimum position size in USD for a synthesized trade action
    #[serde(default = "default_min_position")]
    pub min_position_size: Decimal,
    /// Maximum position size in USD for a synthesized trade action
    #[serde(default = "default_max_position")]
    pub max_position_size: Decimal,
}

fn default_rebalance_threshold() -> Decimal {
    Decimal::new(10, 0)
}

fn default_min_position() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_position() -> Decimal {
    Decimal::new(10_000, 0)
}

impl Default for ConstraintDefaults {
    fn default() -> Self {
        Self {
            rebalance_threshold: default_rebalance_threshold(),
            min_position_size: default_min_position(),
            max_position_size: default_max_position(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the per-ticker analysis worker pool
    pub analysis_url: String,
    /// Base URL of the opportunity-scoring worker
    pub opportunity_url: String,
    /// Base URL of the portfolio-manager decision routine
    pub synthesis_url: String,
    /// Outbound HTTP request timeout in seconds
    #[serde(default = "default_worker_timeout")]
    pub request_timeout_secs: u64,
}

fn default_worker_timeout() -> u64 {
    30
}

/// Capability limits applied when no external role lookup is wired in
#[derive(Debug, Clone, Deserialize)]
pub struct RoleLimitsConfig {
    #[serde(default = "default_max_tickers")]
    pub max_tickers: usize,
    #[serde(default = "default_true")]
    pub rebalance_access: bool,
    #[serde(default = "default_true")]
    pub opportunity_agent_access: bool,
}

fn default_max_tickers() -> usize {
    25
}

fn default_true() -> bool {
    true
}

impl Default for RoleLimitsConfig {
    fn default() -> Self {
        Self {
            max_tickers: default_max_tickers(),
            rebalance_access: true,
            opportunity_agent_access: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Port for the action API (default: 8080)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("REBALANCER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (REBALANCER_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("REBALANCER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
