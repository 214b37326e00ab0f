//! `station` command - run a timing station daemon.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use station::StationDaemon;
use tokio::sync::watch;
use tracing::info;

use crate::cli::StationArgs;

pub async fn run_station(args: &StationArgs) -> Result<()> {
    let settings = ConfigLoader::load_station(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
    }

    info!(
        plugin = settings.plugin.source_type.as_str(),
        server = %settings.daemon.server_addr,
        queue = %settings.daemon.queue_path.display(),
        "starting timing station"
    );

    let daemon = StationDaemon::new(settings).context("building station daemon")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(shutdown_rx).await.context("station daemon failed")?;
    Ok(())
}
