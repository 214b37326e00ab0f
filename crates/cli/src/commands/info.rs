//! `info` command - summarize a configuration file.

use anyhow::Result;
use config_loader::ConfigLoader;
use serde_json::json;

use crate::cli::{ConfigKind, InfoArgs};

pub fn run_info(args: &InfoArgs) -> Result<()> {
    match args.kind {
        ConfigKind::Station => {
            let settings = ConfigLoader::load_station(&args.config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("Timing station configuration: {}", args.config.display());
                println!("  plugin:      {}", settings.plugin.source_type.as_str());
                println!("  server:      {}", settings.daemon.server_addr);
                println!("  queue:       {}", settings.daemon.queue_path.display());
                println!("  timing mode: {:?}", settings.daemon.timing_mode);
                println!(
                    "  reconnect:   {:.1}s  resend: {:.1}s",
                    settings.daemon.reconnect_interval_secs, settings.daemon.resend_interval_secs
                );
            }
        }
        ConfigKind::Proxy => {
            let settings = ConfigLoader::load_proxy(&args.config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("Fan-out proxy configuration: {}", args.config.display());
                println!(
                    "  upstream:    {}:{} ({:?})",
                    settings.upstream.host, settings.upstream.port, settings.upstream.protocol
                );
                println!("  queue dir:   {}", settings.queue_dir.display());
                println!("  clients:");
                for client in &settings.clients {
                    println!("    {:<16} {}", client.name, client.listen_addr);
                }
            }
        }
        ConfigKind::Server => {
            let settings = ConfigLoader::load_server(&args.config)?;
            if args.json {
                // Never echo the secret in machine-readable output
                let mut value = serde_json::to_value(&settings)?;
                value["hmac_secret"] = json!("<redacted>");
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Ingestion server configuration: {}", args.config.display());
                println!("  stations:    {}", settings.bind_addr);
                if let Some(addr) = &settings.events_bind_addr {
                    println!("  events:      {addr}");
                }
                println!(
                    "  dedup window: {:.1}s  suspicious: {:.1}x (min {} laps)",
                    settings.dedup_window_secs,
                    settings.suspicious_multiplier,
                    settings.suspicious_min_samples
                );
            }
        }
    }
    Ok(())
}
