//! # Config Loader
//!
//! Configuration loading and parsing module.
//!
//! Responsibilities:
//! - Parse TOML/JSON configuration files
//! - Validate configuration legality
//! - Produce the typed settings structs from `contracts`
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let settings = ConfigLoader::load_station(Path::new("timing-station.toml")).unwrap();
//! println!("Plugin: {}", settings.plugin.source_type.as_str());
//! ```

mod parser;
mod validator;

pub use contracts::{ProxySettings, ServerSettings, StationSettings};
pub use parser::ConfigFormat;

use contracts::TimingError;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Configuration loader
///
/// Provides static methods to load configuration from files or strings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a timing station configuration.
    ///
    /// Format is detected from the file extension (.toml / .json).
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported format
    /// - Parse failure
    /// - Validation failure
    pub fn load_station(path: &Path) -> Result<StationSettings, TimingError> {
        let settings: StationSettings = Self::load_any(path)?;
        validator::validate_station(&settings)?;
        Ok(settings)
    }

    /// Load a fan-out proxy configuration.
    pub fn load_proxy(path: &Path) -> Result<ProxySettings, TimingError> {
        let settings: ProxySettings = Self::load_any(path)?;
        validator::validate_proxy(&settings)?;
        Ok(settings)
    }

    /// Load an ingestion server configuration.
    pub fn load_server(path: &Path) -> Result<ServerSettings, TimingError> {
        let settings: ServerSettings = Self::load_any(path)?;
        validator::validate_server(&settings)?;
        Ok(settings)
    }

    /// Parse a station configuration from a string (tests, embedding).
    pub fn station_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<StationSettings, TimingError> {
        let settings: StationSettings = parser::parse(content, format)?;
        validator::validate_station(&settings)?;
        Ok(settings)
    }

    /// Parse a proxy configuration from a string.
    pub fn proxy_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<ProxySettings, TimingError> {
        let settings: ProxySettings = parser::parse(content, format)?;
        validator::validate_proxy(&settings)?;
        Ok(settings)
    }

    /// Parse a server configuration from a string.
    pub fn server_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<ServerSettings, TimingError> {
        let settings: ServerSettings = parser::parse(content, format)?;
        validator::validate_server(&settings)?;
        Ok(settings)
    }
}

impl ConfigLoader {
    /// Infer configuration format from file extension
    fn detect_format(path: &Path) -> Result<ConfigFormat, TimingError> {
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            TimingError::config_parse("cannot determine file format from extension")
        })?;

        ConfigFormat::from_extension(ext)
            .ok_or_else(|| TimingError::config_parse(format!("unsupported config format: .{ext}")))
    }

    fn load_any<T: DeserializeOwned>(path: &Path) -> Result<T, TimingError> {
        let format = Self::detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        parser::parse(&content, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_STATION_TOML: &str = r#"
[daemon]
server_addr = "127.0.0.1:8317"
hmac_secret = "timing_hmac_secret_change_me_2025"

[plugin]
type = "simulator"

[plugin.simulator]
num_transponders = 12
lap_time_min = 45.0
lap_time_max = 75.0
"#;

    #[test]
    fn test_station_from_str_toml() {
        let result = ConfigLoader::station_from_str(MINIMAL_STATION_TOML, ConfigFormat::Toml);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
        let settings = result.unwrap();
        assert_eq!(settings.plugin.simulator.num_transponders, 12);
        // Defaults fill the rest
        assert_eq!(settings.daemon.reconnect_interval_secs, 5.0);
        assert_eq!(settings.daemon.rollover_seconds, 360_000.0);
    }

    #[test]
    fn test_station_from_str_json() {
        let content = r#"{
            "daemon": {
                "server_addr": "127.0.0.1:8317",
                "hmac_secret": "secret"
            },
            "plugin": { "type": "network", "network": { "host": "192.168.0.11", "port": 2009 } }
        }"#;
        let result = ConfigLoader::station_from_str(content, ConfigFormat::Json);
        assert!(result.is_ok(), "Failed: {:?}", result.err());
    }

    #[test]
    fn test_validation_runs_after_parse() {
        // Empty secret must fail validation
        let content = MINIMAL_STATION_TOML.replace("timing_hmac_secret_change_me_2025", "");
        let result = ConfigLoader::station_from_str(&content, ConfigFormat::Toml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("hmac_secret"));
    }

    #[test]
    fn test_proxy_round_trip() {
        let content = r#"
[upstream]
host = "192.168.0.11"
port = 2009
protocol = "udp"

[[clients]]
name = "leaderboard"
listen_addr = "0.0.0.0:9101"

[[clients]]
name = "race_control"
listen_addr = "0.0.0.0:9102"
"#;
        let settings = ConfigLoader::proxy_from_str(content, ConfigFormat::Toml).unwrap();
        assert_eq!(settings.clients.len(), 2);
        assert_eq!(settings.resend_interval_secs, 10.0);
    }
}
