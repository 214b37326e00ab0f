//! The station daemon: source -> relay queue -> authenticated uplink.
//!
//! Three concurrent tasks share nothing but the relay queue: the source read
//! loop, the queue writer, and the uplink send/ack loop. The read loop never
//! blocks on the network; the uplink never loses data because everything it
//! sends was journaled first.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_channel::Receiver;
use chrono::Utc;
use contracts::{
    sign_message, verify_message, CrossingEvent, RelayPayload, ServerMessage, StationCommand,
    StationMessage, StationSettings, TimingError,
};
use relay_queue::RelayQueue;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::source::SourcePlugin;

/// Envelopes sent per drain pass.
const DRAIN_BATCH: usize = 64;

/// Uplink connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::Connected,
            1 => Self::Connecting,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Status snapshot for operators and the `get_status` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonStatus {
    pub link: &'static str,
    pub queue: QueueStatsView,
    pub source: crate::source::SourceStatus,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsView {
    pub total: u64,
    pub acked: u64,
    pub pending: u64,
}

/// The timing station daemon.
pub struct StationDaemon {
    settings: StationSettings,
    source: SourcePlugin,
    queue: Arc<Mutex<RelayQueue>>,
    queue_notify: Arc<Notify>,
    link_state: Arc<AtomicU8>,
}

impl StationDaemon {
    /// Build the daemon: open the relay queue journal and construct the
    /// configured source plugin.
    pub fn new(settings: StationSettings) -> Result<Self, TimingError> {
        let queue = RelayQueue::open(&settings.daemon.queue_path)?;
        let source = build_source(&settings);
        Ok(Self {
            settings,
            source,
            queue: Arc::new(Mutex::new(queue)),
            queue_notify: Arc::new(Notify::new()),
            link_state: Arc::new(AtomicU8::new(LinkState::Disconnected as u8)),
        })
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link_state.load(Ordering::Relaxed))
    }

    /// Run until the shutdown signal flips. Unacked envelopes stay in the
    /// journal for the next run.
    #[instrument(name = "station_run", skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TimingError> {
        self.source.connect().await?;

        let (event_tx, event_rx) = async_channel::bounded::<CrossingEvent>(1024);
        self.source.start(event_tx);
        info!("source reading started (independent of uplink)");

        tokio::spawn(queue_writer(
            event_rx,
            self.queue.clone(),
            self.queue_notify.clone(),
        ));

        let reconnect = Duration::from_secs_f64(self.settings.daemon.reconnect_interval_secs);
        let server_addr = self.settings.daemon.server_addr.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_link(LinkState::Connecting);
            info!(server = %server_addr, "connecting to server");

            match TcpStream::connect(&server_addr).await {
                Ok(stream) => {
                    self.set_link(LinkState::Connected);
                    info!("uplink connected");
                    if let Err(e) = self.run_connection(stream, &mut shutdown).await {
                        warn!(error = %e, "uplink lost");
                    }
                    self.set_link(LinkState::Disconnected);
                }
                Err(e) => {
                    self.set_link(LinkState::Disconnected);
                    warn!(error = %e, "connect failed");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            debug!(secs = reconnect.as_secs_f64(), "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(reconnect) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.source.stop();
        info!("station daemon stopped, unacked envelopes remain journaled");
        Ok(())
    }

    /// One connected session: handshake, replay, then live traffic and acks.
    async fn run_connection(
        &mut self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TimingError> {
        let secret = self.settings.daemon.hmac_secret.clone().into_bytes();
        let (read_half, mut write_half) = stream.into_split();

        let handshake = StationMessage::Connected {
            plugin_type: self.source.source_type(),
            timing_mode: self.settings.daemon.timing_mode,
            rollover_seconds: self.settings.daemon.rollover_seconds,
            timestamp: Utc::now(),
        };
        send_signed(&mut write_half, &handshake, &secret).await?;

        // Replay everything unacked from previous sessions, then go live
        let mut last_sent = 0u64;
        self.drain_queue(&mut write_half, &mut last_sent, &secret).await?;

        let mut lines = BufReader::new(read_half).lines();
        let resend_period =
            Duration::from_secs_f64(self.settings.daemon.resend_interval_secs.max(0.5));
        let mut resend_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + resend_period, resend_period);
        resend_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let notify = self.queue_notify.clone();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            self.handle_server_line(&line, &mut write_half, &secret).await?;
                        }
                        Ok(None) => return Err(TimingError::channel("server closed connection")),
                        Err(e) => return Err(TimingError::channel_from("uplink read", e)),
                    }
                }
                _ = notify.notified() => {
                    self.drain_queue(&mut write_half, &mut last_sent, &secret).await?;
                }
                _ = resend_tick.tick() => {
                    // Unacked entries go out again until the server acks them
                    last_sent = 0;
                    self.drain_queue(&mut write_half, &mut last_sent, &secret).await?;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Send queued envelopes above `last_sent` in sequence order.
    async fn drain_queue(
        &self,
        write_half: &mut OwnedWriteHalf,
        last_sent: &mut u64,
        secret: &[u8],
    ) -> Result<(), TimingError> {
        loop {
            let batch: Vec<_> = {
                let queue = self.queue.lock().await;
                queue
                    .peek_batch(DRAIN_BATCH)
                    .into_iter()
                    .filter(|env| env.sequence_id > *last_sent)
                    .collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            for envelope in batch {
                let message = match envelope.payload {
                    RelayPayload::Crossing(event) => StationMessage::LapCrossing {
                        sequence_id: envelope.sequence_id,
                        event,
                    },
                    RelayPayload::Control { message } => StationMessage::Warning { message },
                };
                send_signed(write_half, &message, secret).await?;
                *last_sent = envelope.sequence_id;
                metrics::counter!("station_envelopes_sent_total").increment(1);
            }
        }
    }

    async fn handle_server_line(
        &self,
        line: &str,
        write_half: &mut OwnedWriteHalf,
        secret: &[u8],
    ) -> Result<(), TimingError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let mut value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "invalid json from server");
                return Ok(());
            }
        };
        if let Err(e) = verify_message(&mut value, secret) {
            warn!(error = %e, "rejecting unauthenticated server message");
            return Ok(());
        }
        let message: ServerMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unrecognized server message");
                return Ok(());
            }
        };

        match message {
            ServerMessage::Ack { sequence_id } => {
                let removed = {
                    let mut queue = self.queue.lock().await;
                    queue.ack(sequence_id)?
                };
                debug!(sequence_id, removed, "server ack");
            }
            ServerMessage::Command { command } => {
                self.handle_command(command, write_half, secret).await?;
            }
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        command: StationCommand,
        write_half: &mut OwnedWriteHalf,
        secret: &[u8],
    ) -> Result<(), TimingError> {
        match command {
            StationCommand::GetStatus => {
                let status = self.status().await;
                let response = StationMessage::Response {
                    response: "status".to_string(),
                    status: json!(status),
                };
                send_signed(write_half, &response, secret).await?;
            }
            // Race control is server-side; the station just observes these
            StationCommand::StartRace { race_id } => info!(race_id, "race started"),
            StationCommand::EndRace { race_id } => info!(race_id, "race ended"),
            StationCommand::UpdateAssignments { assignments } => {
                info!(count = assignments.len(), "assignments updated server-side");
            }
        }
        Ok(())
    }

    /// Status snapshot.
    pub async fn status(&self) -> DaemonStatus {
        let stats = {
            let queue = self.queue.lock().await;
            queue.stats()
        };
        DaemonStatus {
            link: self.link_state().as_str(),
            queue: QueueStatsView {
                total: stats.total,
                acked: stats.acked,
                pending: stats.pending,
            },
            source: self.source.status(),
        }
    }

    fn set_link(&self, state: LinkState) {
        self.link_state.store(state as u8, Ordering::Relaxed);
    }
}

/// Move crossings from the source channel into the durable queue.
///
/// Local enqueue is independent of network availability; the uplink is only
/// poked afterwards.
async fn queue_writer(
    events: Receiver<CrossingEvent>,
    queue: Arc<Mutex<RelayQueue>>,
    notify: Arc<Notify>,
) {
    while let Ok(event) = events.recv().await {
        let result = {
            let mut queue = queue.lock().await;
            queue.enqueue(RelayPayload::Crossing(event))
        };
        match result {
            Ok(sequence_id) => {
                debug!(sequence_id, "crossing journaled");
                notify.notify_one();
            }
            Err(e) => error!(error = %e, "failed to journal crossing"),
        }
    }
    debug!("queue writer stopped");
}

async fn send_signed(
    write_half: &mut OwnedWriteHalf,
    message: &StationMessage,
    secret: &[u8],
) -> Result<(), TimingError> {
    let mut value = serde_json::to_value(message)
        .map_err(|e| TimingError::invariant(format!("message encode: {e}")))?;
    sign_message(&mut value, secret)?;
    let line = value.to_string();
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| TimingError::channel_from("uplink write", e))?;
    write_half
        .write_all(b"\n")
        .await
        .map_err(|e| TimingError::channel_from("uplink write", e))?;
    Ok(())
}

fn build_source(settings: &StationSettings) -> SourcePlugin {
    use contracts::SourceType;
    match settings.plugin.source_type {
        SourceType::Simulator => SourcePlugin::Simulator(crate::SimulatorSource::new(
            settings.plugin.simulator.clone(),
            settings.daemon.timing_mode,
            settings.daemon.rollover_seconds,
        )),
        SourceType::Serial => {
            SourcePlugin::Serial(crate::SerialSource::new(settings.plugin.serial.clone()))
        }
        SourceType::Network => {
            SourcePlugin::Network(crate::NetworkSource::new(settings.plugin.network.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DaemonSettings, PluginSettings, SimulatorSettings, TimingMode};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    fn settings(server_addr: String, queue_path: std::path::PathBuf) -> StationSettings {
        StationSettings {
            daemon: DaemonSettings {
                server_addr,
                hmac_secret: "test_secret".to_string(),
                reconnect_interval_secs: 0.2,
                resend_interval_secs: 0.5,
                queue_path,
                timing_mode: TimingMode::Duration,
                rollover_seconds: 360_000.0,
            },
            plugin: PluginSettings {
                source_type: contracts::SourceType::Simulator,
                simulator: SimulatorSettings {
                    num_transponders: 2,
                    lap_time_min: 0.5,
                    lap_time_max: 1.0,
                    lap_time_variance: 0.1,
                    transponder_ids: Vec::new(),
                    sim_speed: 100.0,
                },
                serial: Default::default(),
                network: Default::default(),
            },
        }
    }

    async fn read_verified_message(
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
        secret: &[u8],
    ) -> StationMessage {
        let line = lines.next_line().await.unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&line).unwrap();
        verify_message(&mut value, secret).unwrap();
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_daemon_handshakes_sends_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let secret = b"test_secret".to_vec();

        let daemon =
            StationDaemon::new(settings(addr.to_string(), dir.path().join("q.jsonl"))).unwrap();
        let queue = daemon.queue.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let daemon_task = tokio::spawn(daemon.run(shutdown_rx));

        // Accept the uplink and play server
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // 1. Handshake comes first
        let first = read_verified_message(&mut lines, &secret).await;
        assert!(matches!(first, StationMessage::Connected { .. }));

        // 2. Simulated crossings arrive as signed lap_crossing envelopes
        let message = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StationMessage::LapCrossing { sequence_id, .. } =
                    read_verified_message(&mut lines, &secret).await
                {
                    return sequence_id;
                }
            }
        })
        .await
        .expect("daemon should forward crossings");

        // 3. Ack removes the envelope from the durable queue
        let ack = ServerMessage::Ack { sequence_id: message };
        let mut value = serde_json::to_value(&ack).unwrap();
        sign_message(&mut value, &secret).unwrap();
        write_half
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let q = queue.lock().await;
                    if q.first_pending().map(|s| s > message).unwrap_or(true) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("ack should clear the envelope");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), daemon_task).await;
    }

    #[tokio::test]
    async fn test_unacked_envelopes_resent_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let secret = b"test_secret".to_vec();

        let daemon =
            StationDaemon::new(settings(addr.to_string(), dir.path().join("q.jsonl"))).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let daemon_task = tokio::spawn(daemon.run(shutdown_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StationMessage::LapCrossing { sequence_id, .. } =
                    read_verified_message(&mut lines, &secret).await
                {
                    return sequence_id;
                }
            }
        })
        .await
        .unwrap();

        // Never ack: the same sequence id must show up again
        let resent = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StationMessage::LapCrossing { sequence_id, .. } =
                    read_verified_message(&mut lines, &secret).await
                {
                    if sequence_id == first {
                        return true;
                    }
                }
            }
        })
        .await
        .expect("unacked envelope should be resent");
        assert!(resent);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), daemon_task).await;
    }
}
