//! FanoutProxy - one upstream decoder, N independent downstream clients.

use contracts::{ProxySettings, TimingError};
use station::{NetworkSource, SourcePlugin};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::client::ClientHandle;

/// The fan-out proxy.
///
/// Decodes each upstream frame exactly once and replicates the resulting
/// crossing into every downstream client's durable queue. Client delivery
/// loops run independently; see [`ClientHandle`].
pub struct FanoutProxy {
    settings: ProxySettings,
}

impl FanoutProxy {
    pub fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    /// Run until the shutdown signal flips.
    #[instrument(name = "fanout_run", skip_all, fields(clients = self.settings.clients.len()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TimingError> {
        if self.settings.clients.is_empty() {
            return Err(TimingError::config_validation(
                "clients",
                "fan-out proxy needs at least one downstream client",
            ));
        }

        std::fs::create_dir_all(&self.settings.queue_dir)?;

        let handles: Vec<ClientHandle> = self
            .settings
            .clients
            .iter()
            .map(|client| {
                ClientHandle::spawn(
                    client.name.clone(),
                    client.listen_addr.clone(),
                    self.settings
                        .queue_dir
                        .join(format!("{}.jsonl", client.name)),
                    self.settings.resend_interval_secs,
                )
            })
            .collect();
        info!(clients = handles.len(), "downstream workers started");

        // The proxy is the decoder's single remote endpoint
        let mut upstream = SourcePlugin::Network(NetworkSource::new(self.settings.upstream.clone()));
        upstream.connect().await?;
        let (event_tx, event_rx) = async_channel::bounded(1024);
        upstream.start(event_tx);
        info!("upstream decoder link up");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Ok(event) = event else {
                        warn!("upstream channel closed");
                        break;
                    };
                    metrics::counter!("fanout_upstream_frames_total").increment(1);
                    // Decode once, enqueue everywhere
                    for handle in &handles {
                        handle.try_send(event.clone());
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        upstream.stop();
        for handle in handles {
            handle.shutdown().await;
        }
        debug!("fan-out proxy stopped");
        Ok(())
    }
}
