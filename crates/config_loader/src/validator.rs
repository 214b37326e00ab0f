//! Configuration validation
//!
//! Cross-field checks that serde cannot express. Parsing and validation are
//! separate passes; a settings value that parsed is not yet trusted.

use std::collections::HashSet;

use contracts::{ProxySettings, ServerSettings, SourceType, StationSettings, TimingError};

pub fn validate_station(settings: &StationSettings) -> Result<(), TimingError> {
    validate_secret(&settings.daemon.hmac_secret)?;
    validate_addr("daemon.server_addr", &settings.daemon.server_addr)?;

    if settings.daemon.reconnect_interval_secs <= 0.0 {
        return Err(TimingError::config_validation(
            "daemon.reconnect_interval_secs",
            "must be positive",
        ));
    }
    if settings.daemon.rollover_seconds <= 0.0 {
        return Err(TimingError::config_validation(
            "daemon.rollover_seconds",
            "must be positive",
        ));
    }

    match settings.plugin.source_type {
        SourceType::Simulator => {
            let sim = &settings.plugin.simulator;
            if sim.lap_time_min <= 0.0 || sim.lap_time_max < sim.lap_time_min {
                return Err(TimingError::config_validation(
                    "plugin.simulator",
                    "need 0 < lap_time_min <= lap_time_max",
                ));
            }
            if sim.num_transponders == 0 && sim.transponder_ids.is_empty() {
                return Err(TimingError::config_validation(
                    "plugin.simulator.num_transponders",
                    "need at least one transponder",
                ));
            }
        }
        SourceType::Serial => {
            if settings.plugin.serial.device.is_empty() {
                return Err(TimingError::config_validation(
                    "plugin.serial.device",
                    "must not be empty",
                ));
            }
        }
        SourceType::Network => {
            if settings.plugin.network.port == 0 {
                return Err(TimingError::config_validation(
                    "plugin.network.port",
                    "must not be zero",
                ));
            }
        }
    }
    Ok(())
}

pub fn validate_proxy(settings: &ProxySettings) -> Result<(), TimingError> {
    if settings.clients.is_empty() {
        return Err(TimingError::config_validation(
            "clients",
            "need at least one downstream client",
        ));
    }
    let mut names = HashSet::new();
    let mut addrs = HashSet::new();
    for client in &settings.clients {
        if client.name.is_empty() {
            return Err(TimingError::config_validation("clients.name", "must not be empty"));
        }
        if !names.insert(client.name.as_str()) {
            return Err(TimingError::config_validation(
                "clients.name",
                format!("duplicate client name '{}'", client.name),
            ));
        }
        validate_addr("clients.listen_addr", &client.listen_addr)?;
        if !addrs.insert(client.listen_addr.as_str()) {
            return Err(TimingError::config_validation(
                "clients.listen_addr",
                format!("duplicate listen address '{}'", client.listen_addr),
            ));
        }
    }
    if settings.upstream.port == 0 {
        return Err(TimingError::config_validation("upstream.port", "must not be zero"));
    }
    if settings.resend_interval_secs <= 0.0 {
        return Err(TimingError::config_validation(
            "resend_interval_secs",
            "must be positive",
        ));
    }
    Ok(())
}

pub fn validate_server(settings: &ServerSettings) -> Result<(), TimingError> {
    validate_secret(&settings.hmac_secret)?;
    validate_addr("bind_addr", &settings.bind_addr)?;
    if let Some(addr) = &settings.events_bind_addr {
        validate_addr("events_bind_addr", addr)?;
    }
    if settings.dedup_window_secs <= 0.0 {
        return Err(TimingError::config_validation(
            "dedup_window_secs",
            "must be positive",
        ));
    }
    if settings.suspicious_multiplier <= 1.0 {
        return Err(TimingError::config_validation(
            "suspicious_multiplier",
            "must be greater than 1",
        ));
    }
    Ok(())
}

fn validate_secret(secret: &str) -> Result<(), TimingError> {
    if secret.is_empty() {
        return Err(TimingError::config_validation(
            "hmac_secret",
            "must not be empty",
        ));
    }
    Ok(())
}

fn validate_addr(field: &str, addr: &str) -> Result<(), TimingError> {
    // host:port, where host may be a name - only the shape is checked here
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse::<u16>().map(|_| ()).map_err(|_| {
                TimingError::config_validation(field, format!("invalid port in '{addr}'"))
            })
        }
        _ => Err(TimingError::config_validation(
            field,
            format!("expected host:port, got '{addr}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        DaemonSettings, NetworkSettings, PluginSettings, ProxyClientSettings, TimingMode,
    };

    fn station() -> StationSettings {
        StationSettings {
            daemon: DaemonSettings {
                server_addr: "127.0.0.1:8317".to_string(),
                hmac_secret: "secret".to_string(),
                reconnect_interval_secs: 5.0,
                resend_interval_secs: 10.0,
                queue_path: "q.jsonl".into(),
                timing_mode: TimingMode::Duration,
                rollover_seconds: 360_000.0,
            },
            plugin: PluginSettings {
                source_type: SourceType::Simulator,
                simulator: Default::default(),
                serial: Default::default(),
                network: Default::default(),
            },
        }
    }

    #[test]
    fn test_valid_station_passes() {
        assert!(validate_station(&station()).is_ok());
    }

    #[test]
    fn test_bad_addr_rejected() {
        let mut s = station();
        s.daemon.server_addr = "no-port".to_string();
        assert!(validate_station(&s).is_err());
        s.daemon.server_addr = "host:99999".to_string();
        assert!(validate_station(&s).is_err());
    }

    #[test]
    fn test_simulator_lap_range_rejected() {
        let mut s = station();
        s.plugin.simulator.lap_time_min = 80.0;
        s.plugin.simulator.lap_time_max = 45.0;
        assert!(validate_station(&s).is_err());
    }

    #[test]
    fn test_duplicate_proxy_client_names_rejected() {
        let proxy = ProxySettings {
            upstream: NetworkSettings::default(),
            clients: vec![
                ProxyClientSettings {
                    name: "a".to_string(),
                    listen_addr: "0.0.0.0:9101".to_string(),
                },
                ProxyClientSettings {
                    name: "a".to_string(),
                    listen_addr: "0.0.0.0:9102".to_string(),
                },
            ],
            resend_interval_secs: 10.0,
            queue_dir: "queues".into(),
        };
        let err = validate_proxy(&proxy).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
