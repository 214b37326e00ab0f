//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Trackside - transponder lap timing pipeline
#[derive(Parser, Debug)]
#[command(
    name = "trackside",
    author,
    version,
    about = "Real-time lap timing pipeline",
    long_about = "Real-time lap timing and race-lifecycle engine.\n\n\
                  Runs timing station daemons against decoder hardware or a simulator, \n\
                  fans a single decoder feed out to multiple consumers, and hosts the \n\
                  server-side crossing ingestion and race control core."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "TRACKSIDE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "TRACKSIDE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a timing station daemon
    Station(StationArgs),

    /// Run the decoder fan-out proxy
    Proxy(ProxyArgs),

    /// Run the ingestion server
    Serve(ServeArgs),

    /// Validate a configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `station` command
#[derive(Parser, Debug, Clone)]
pub struct StationArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "timing-station.toml",
        env = "TRACKSIDE_STATION_CONFIG"
    )]
    pub config: PathBuf,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "TRACKSIDE_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `proxy` command
#[derive(Parser, Debug, Clone)]
pub struct ProxyArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "proxy.toml", env = "TRACKSIDE_PROXY_CONFIG")]
    pub config: PathBuf,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "TRACKSIDE_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `serve` command
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "server.toml", env = "TRACKSIDE_SERVER_CONFIG")]
    pub config: PathBuf,

    /// Round bootstrap file: races, teams, transponder assignments (JSON)
    #[arg(short, long, default_value = "round.json", env = "TRACKSIDE_ROUND")]
    pub round: PathBuf,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "9000", env = "TRACKSIDE_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long)]
    pub config: PathBuf,

    /// Which configuration schema to check against
    #[arg(long, value_enum, default_value = "station")]
    pub kind: ConfigKind,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Which configuration schema to read
    #[arg(long, value_enum, default_value = "station")]
    pub kind: ConfigKind,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Configuration schema selector
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKind {
    Station,
    Proxy,
    Server,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
