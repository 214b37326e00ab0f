//! `proxy` command - run the decoder fan-out proxy.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use fanout::FanoutProxy;
use tokio::sync::watch;
use tracing::info;

use crate::cli::ProxyArgs;

pub async fn run_proxy(args: &ProxyArgs) -> Result<()> {
    let settings = ConfigLoader::load_proxy(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
    }

    info!(
        upstream = format!("{}:{}", settings.upstream.host, settings.upstream.port),
        clients = settings.clients.len(),
        "starting fan-out proxy"
    );

    let proxy = FanoutProxy::new(settings);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    proxy.run(shutdown_rx).await.context("fan-out proxy failed")?;
    Ok(())
}
