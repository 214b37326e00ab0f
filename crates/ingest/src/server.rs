//! TCP ingestion endpoint.
//!
//! Stations connect with a persistent channel carrying newline-delimited
//! signed JSON. Each crossing is verified, handed to the single engine task,
//! and acked back to the station only after the engine has processed it.
//! Auth and decode failures drop the one message, never the connection.
//!
//! A second listener streams broadcast [`RaceEvent`]s as JSON lines to UI
//! consumers (leaderboard, race control); that side is read-only.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use contracts::{
    sign_message, verify_message, CrossingEvent, LapStore, RaceEvent, ServerMessage, StationMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::IngestionEngine;
use crate::leaderboard::LeaderboardAggregator;

/// Ingestion server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where stations connect
    pub bind_addr: SocketAddr,
    /// Where UI consumers connect for the event stream (None = disabled)
    pub events_bind_addr: Option<SocketAddr>,
    /// Shared secret for message authentication
    pub hmac_secret: String,
    /// Seconds between timer-driven finish evaluations
    pub tick_interval_secs: f64,
    /// Seconds between leaderboard recomputations
    pub leaderboard_debounce_secs: f64,
}

/// Cloneable handle for feeding the engine task.
#[derive(Clone)]
struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

struct EngineRequest {
    event: CrossingEvent,
    sequence_id: u64,
    /// Outbound line channel of the originating connection, for the ack
    reply: mpsc::Sender<String>,
}

impl EngineHandle {
    async fn submit(&self, request: EngineRequest) {
        if self.tx.send(request).await.is_err() {
            error!("engine task is gone");
        }
    }
}

/// Run the ingestion server until the listener fails.
pub async fn run_server<S: LapStore + Send + 'static>(
    config: ServerConfig,
    engine: IngestionEngine<S>,
    events: broadcast::Sender<RaceEvent>,
) -> std::io::Result<()> {
    let (engine_tx, engine_rx) = mpsc::channel(256);
    let handle = EngineHandle { tx: engine_tx };

    let secret = config.hmac_secret.clone().into_bytes();
    tokio::spawn(engine_task(
        engine,
        engine_rx,
        events.clone(),
        secret.clone(),
        config.tick_interval_secs,
        config.leaderboard_debounce_secs,
    ));

    if let Some(events_addr) = config.events_bind_addr {
        tokio::spawn(events_listener(events_addr, events.clone()));
    }

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "ingestion server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "station connected");
        let handle = handle.clone();
        let secret = secret.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_station(stream, handle, secret, events).await {
                warn!(%peer, error = %e, "station connection closed");
            } else {
                info!(%peer, "station disconnected");
            }
        });
    }
}

/// The single-writer engine task: every crossing in the system funnels
/// through here, which is what keeps per-team lap numbering in order.
async fn engine_task<S: LapStore>(
    mut engine: IngestionEngine<S>,
    mut rx: mpsc::Receiver<EngineRequest>,
    events: broadcast::Sender<RaceEvent>,
    secret: Vec<u8>,
    tick_interval_secs: f64,
    leaderboard_debounce_secs: f64,
) {
    let mut aggregator = LeaderboardAggregator::new(leaderboard_debounce_secs);
    let tick_period = Duration::from_secs_f64(tick_interval_secs.max(0.1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick_period, tick_period);

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let produced = engine.handle_crossing(&request.event);
                broadcast_events(&engine, &mut aggregator, &events, produced);
                send_ack(&request.reply, request.sequence_id, &secret).await;
            }
            _ = ticker.tick() => {
                let produced = engine.tick(chrono::Utc::now());
                broadcast_events(&engine, &mut aggregator, &events, produced);
            }
        }
    }
    debug!("engine task stopped");
}

fn broadcast_events<S: LapStore>(
    engine: &IngestionEngine<S>,
    aggregator: &mut LeaderboardAggregator,
    events: &broadcast::Sender<RaceEvent>,
    produced: Vec<RaceEvent>,
) {
    let mut standings_for = None;
    for event in produced {
        if let RaceEvent::RaceLapUpdate { race_id, .. } = &event {
            standings_for = Some(*race_id);
        }
        // Send errors just mean nobody is listening right now
        let _ = events.send(event);
    }
    if let Some(race_id) = standings_for {
        if aggregator.should_emit(Instant::now()) {
            let standings = engine.standings(race_id);
            let _ = events.send(RaceEvent::StandingsUpdate { race_id, standings });
        }
    }
}

async fn send_ack(reply: &mpsc::Sender<String>, sequence_id: u64, secret: &[u8]) {
    let ack = ServerMessage::Ack { sequence_id };
    let mut value = match serde_json::to_value(&ack) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "ack encode failed");
            return;
        }
    };
    if let Err(e) = sign_message(&mut value, secret) {
        error!(error = %e, "ack signing failed");
        return;
    }
    let _ = reply.send(value.to_string()).await;
}

#[instrument(name = "station_connection", skip_all)]
async fn handle_station(
    stream: TcpStream,
    handle: EngineHandle,
    secret: Vec<u8>,
    events: broadcast::Sender<RaceEvent>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "invalid json from station");
                continue;
            }
        };
        if let Err(e) = verify_message(&mut value, &secret) {
            warn!(error = %e, "rejecting unauthenticated message");
            metrics::counter!("ingest_auth_failures_total").increment(1);
            continue;
        }
        let message: StationMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unrecognized station message");
                continue;
            }
        };
        match message {
            StationMessage::Connected {
                plugin_type,
                timing_mode,
                rollover_seconds,
                ..
            } => {
                info!(
                    plugin_type = plugin_type.as_str(),
                    ?timing_mode,
                    rollover_seconds,
                    "station handshake"
                );
            }
            StationMessage::LapCrossing { sequence_id, event } => {
                handle
                    .submit(EngineRequest {
                        event,
                        sequence_id,
                        reply: out_tx.clone(),
                    })
                    .await;
            }
            StationMessage::Warning { message } => {
                warn!(message = %message, "station warning");
                let _ = events.send(RaceEvent::Warning { message });
            }
            StationMessage::Response { response, .. } => {
                debug!(response = %response, "station response");
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Push every broadcast event to connected UI consumers as JSON lines.
async fn events_listener(addr: SocketAddr, events: broadcast::Sender<RaceEvent>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "event stream listener failed to bind");
            return;
        }
    };
    info!(%addr, "event stream listening");

    loop {
        let Ok((mut stream, peer)) = listener.accept().await else {
            break;
        };
        debug!(%peer, "event consumer connected");
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Ok(line) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if stream.write_all(line.as_bytes()).await.is_err()
                            || stream.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%peer, skipped, "event consumer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%peer, "event consumer disconnected");
        });
    }
}
