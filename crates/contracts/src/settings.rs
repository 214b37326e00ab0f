//! Deployment settings - the shape of the TOML/JSON configuration files
//!
//! Parsed and validated by the `config_loader` crate. Every tunable the core
//! treats as an input (plugin type, connection parameters, HMAC secret, dedup
//! window, suspicious-lap multiplier, grace periods, intervals) lives here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Endianness, SourceType, TimingMode};

/// Timing station daemon configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSettings {
    pub daemon: DaemonSettings,
    pub plugin: PluginSettings,
}

/// `[daemon]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Server endpoint, `host:port`
    pub server_addr: String,
    /// Shared secret for message authentication
    pub hmac_secret: String,
    /// Seconds between reconnect attempts (fixed, not exponential)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: f64,
    /// Seconds between resends of unacked envelopes while connected
    #[serde(default = "default_resend_interval")]
    pub resend_interval_secs: f64,
    /// Relay queue journal location
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
    /// What the decoder's raw time means (handshake metadata)
    #[serde(default)]
    pub timing_mode: TimingMode,
    /// Rollover for `own_time` decoders, seconds
    #[serde(default = "default_rollover")]
    pub rollover_seconds: f64,
}

/// `[plugin]` section: the fixed closed set of timing sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Which source to run, selected once at startup
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub simulator: SimulatorSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub network: NetworkSettings,
}

/// Synthetic crossing generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorSettings {
    #[serde(default = "default_num_transponders")]
    pub num_transponders: usize,
    /// Seconds
    #[serde(default = "default_lap_time_min")]
    pub lap_time_min: f64,
    #[serde(default = "default_lap_time_max")]
    pub lap_time_max: f64,
    #[serde(default = "default_lap_time_variance")]
    pub lap_time_variance: f64,
    /// Fixed transponder id list; overrides the auto-generated pool
    #[serde(default)]
    pub transponder_ids: Vec<String>,
    /// 1.0 = real time, 10.0 = ten times faster
    #[serde(default = "default_sim_speed")]
    pub sim_speed: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            num_transponders: default_num_transponders(),
            lap_time_min: default_lap_time_min(),
            lap_time_max: default_lap_time_max(),
            lap_time_variance: default_lap_time_variance(),
            transponder_ids: Vec::new(),
            sim_speed: default_sim_speed(),
        }
    }
}

/// Stream-oriented serial decoder link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_serial_device")]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub endian: Endianness,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud: default_baud(),
            endian: Endianness::default(),
        }
    }
}

/// Datagram or stream network decoder link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_decoder_host")]
    pub host: String,
    #[serde(default = "default_decoder_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: NetProtocol,
    #[serde(default)]
    pub endian: Endianness,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: default_decoder_host(),
            port: default_decoder_port(),
            protocol: NetProtocol::default(),
            endian: Endianness::default(),
        }
    }
}

/// Network decoder transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetProtocol {
    #[default]
    Udp,
    Tcp,
}

/// Fan-out proxy configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Upstream decoder link (the proxy is its single remote endpoint)
    pub upstream: NetworkSettings,
    /// Downstream clients, each with an independent durable queue
    pub clients: Vec<ProxyClientSettings>,
    /// Seconds between resends of unacked entries per client
    #[serde(default = "default_resend_interval")]
    pub resend_interval_secs: f64,
    /// Directory for per-client queue journals
    #[serde(default = "default_proxy_queue_dir")]
    pub queue_dir: PathBuf,
}

/// One downstream consumer of the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyClientSettings {
    /// Stable name; also names the queue journal
    pub name: String,
    /// Where this client connects, `host:port`
    pub listen_addr: String,
}

/// Ingestion server configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Station listener, `host:port`
    pub bind_addr: String,
    /// UI event stream listener (omit to disable)
    #[serde(default)]
    pub events_bind_addr: Option<String>,
    pub hmac_secret: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: f64,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: f64,
    #[serde(default = "default_suspicious_multiplier")]
    pub suspicious_multiplier: f64,
    #[serde(default = "default_suspicious_min_samples")]
    pub suspicious_min_samples: usize,
    #[serde(default = "default_leaderboard_debounce")]
    pub leaderboard_debounce_secs: f64,
    /// Seconds after Start during which False Start is allowed
    #[serde(default = "default_false_start_grace")]
    pub false_start_grace_secs: f64,
    /// Seconds after Resume during which False Restart is allowed
    #[serde(default = "default_false_start_grace")]
    pub false_restart_grace_secs: f64,
}

fn default_reconnect_interval() -> f64 {
    5.0
}

fn default_resend_interval() -> f64 {
    10.0
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("crossing_relay.jsonl")
}

fn default_rollover() -> f64 {
    360_000.0
}

fn default_num_transponders() -> usize {
    10
}

fn default_lap_time_min() -> f64 {
    45.0
}

fn default_lap_time_max() -> f64 {
    75.0
}

fn default_lap_time_variance() -> f64 {
    5.0
}

fn default_sim_speed() -> f64 {
    10.0
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    9600
}

fn default_decoder_host() -> String {
    "192.168.0.11".to_string()
}

fn default_decoder_port() -> u16 {
    2009
}

fn default_proxy_queue_dir() -> PathBuf {
    PathBuf::from("proxy_queues")
}

fn default_tick_interval() -> f64 {
    1.0
}

fn default_dedup_window() -> f64 {
    7.0
}

fn default_suspicious_multiplier() -> f64 {
    2.0
}

fn default_suspicious_min_samples() -> usize {
    3
}

fn default_leaderboard_debounce() -> f64 {
    1.0
}

fn default_false_start_grace() -> f64 {
    15.0
}
