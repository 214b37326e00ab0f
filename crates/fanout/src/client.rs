//! ClientHandle - one downstream client with isolated queue and worker task.
//!
//! Wire format toward the client: newline-delimited JSON
//! `{"sequence_id": n, "payload": {...}}` (the relay envelope), answered by
//! cumulative `{"ack": n}` lines.

use std::path::PathBuf;

use async_channel::{Receiver, Sender, TrySendError};
use contracts::{CrossingEvent, RelayPayload};
use relay_queue::RelayQueue;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Envelopes sent per drain pass.
const DRAIN_BATCH: usize = 64;

#[derive(Debug, Deserialize)]
struct AckLine {
    ack: u64,
}

/// Handle to a running downstream client worker.
pub struct ClientHandle {
    name: String,
    tx: Sender<CrossingEvent>,
    worker: JoinHandle<()>,
}

impl ClientHandle {
    /// Spawn the worker: opens the client's durable queue and starts
    /// listening for the client on `listen_addr`.
    pub fn spawn(
        name: String,
        listen_addr: String,
        queue_path: PathBuf,
        resend_interval_secs: f64,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(1024);
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            client_worker(worker_name, listen_addr, queue_path, resend_interval_secs, rx).await;
        });
        Self { name, tx, worker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replicate a crossing into this client's queue (non-blocking).
    ///
    /// Returns false when the worker's inbox is full and the event was
    /// dropped for this client.
    pub fn try_send(&self, event: CrossingEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::counter!("fanout_dropped_total", "client" => self.name.clone())
                    .increment(1);
                warn!(client = %self.name, "worker inbox full, crossing dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!(client = %self.name, "worker stopped unexpectedly");
                false
            }
        }
    }

    /// Stop accepting new events and wait for the worker to wind down.
    /// Unacked envelopes stay journaled for the next run.
    pub async fn shutdown(self) {
        self.tx.close();
        if let Err(e) = self.worker.await {
            error!(client = %self.name, error = ?e, "worker task panicked");
        }
        debug!(client = %self.name, "client worker shut down");
    }
}

/// The per-client worker: sole owner of the client's queue.
async fn client_worker(
    name: String,
    listen_addr: String,
    queue_path: PathBuf,
    resend_interval_secs: f64,
    events: Receiver<CrossingEvent>,
) {
    let mut queue = match RelayQueue::open(&queue_path) {
        Ok(q) => q,
        Err(e) => {
            error!(client = %name, error = %e, "cannot open client queue");
            return;
        }
    };
    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(client = %name, addr = %listen_addr, error = %e, "cannot bind client port");
            return;
        }
    };
    info!(client = %name, addr = %listen_addr, "client worker listening");

    'outer: loop {
        // Disconnected: keep journaling events while waiting for the client
        let connection = loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => enqueue(&mut queue, &name, event),
                        Err(_) => break 'outer,
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(client = %name, %peer, "client connected");
                            break stream.into_split();
                        }
                        Err(e) => {
                            error!(client = %name, error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    }
                }
            }
        };

        let (read_half, mut write_half) = connection;
        let mut lines = BufReader::new(read_half).lines();
        let resend_period = Duration::from_secs_f64(resend_interval_secs.max(0.5));
        let mut resend_tick = tokio::time::interval(resend_period);

        // Connected: replay unacked first (resend tick fires immediately),
        // then interleave live traffic and acks
        let mut last_sent = 0u64;
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            enqueue(&mut queue, &name, event);
                            if drain(&mut queue, &mut write_half, &mut last_sent, &name).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break 'outer,
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => handle_ack(&mut queue, &name, &line),
                        Ok(None) | Err(_) => {
                            info!(client = %name, "client disconnected");
                            break;
                        }
                    }
                }
                _ = resend_tick.tick() => {
                    // Everything unacked goes out again until acked
                    last_sent = 0;
                    if drain(&mut queue, &mut write_half, &mut last_sent, &name).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(client = %name, "client worker stopped");
}

fn enqueue(queue: &mut RelayQueue, name: &str, event: CrossingEvent) {
    if let Err(e) = queue.enqueue(RelayPayload::Crossing(event)) {
        error!(client = %name, error = %e, "failed to journal crossing");
    }
}

fn handle_ack(queue: &mut RelayQueue, name: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<AckLine>(line) {
        Ok(AckLine { ack }) => match queue.ack(ack) {
            Ok(removed) => debug!(client = %name, ack, removed, "client ack"),
            Err(e) => error!(client = %name, error = %e, "ack failed"),
        },
        Err(e) => warn!(client = %name, error = %e, "unparseable line from client"),
    }
}

async fn drain(
    queue: &mut RelayQueue,
    write_half: &mut OwnedWriteHalf,
    last_sent: &mut u64,
    name: &str,
) -> std::io::Result<()> {
    loop {
        let batch: Vec<_> = queue
            .peek_batch(DRAIN_BATCH)
            .into_iter()
            .filter(|env| env.sequence_id > *last_sent)
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        for envelope in batch {
            let line = match serde_json::to_string(&envelope) {
                Ok(l) => l,
                Err(e) => {
                    error!(client = %name, error = %e, "envelope encode failed");
                    continue;
                }
            };
            write_half.write_all(line.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            *last_sent = envelope.sequence_id;
            metrics::counter!("fanout_sent_total", "client" => name.to_string()).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use contracts::RelayEnvelope;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpStream;

    fn crossing(id: &str) -> CrossingEvent {
        CrossingEvent {
            transponder_id: id.into(),
            timestamp: Utc::now(),
            raw_time: 1.0,
            signal_strength: 90,
            source_sequence: None,
        }
    }

    async fn read_envelope(
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    ) -> RelayEnvelope {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_client_receives_acks_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handle = ClientHandle::spawn(
            "leaderboard".to_string(),
            addr.clone(),
            dir.path().join("leaderboard.jsonl"),
            0.5,
        );

        // Events journaled before any client connects
        assert!(handle.try_send(crossing("100001")));
        assert!(handle.try_send(crossing("100002")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // First client session: both arrive in order
        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = read_envelope(&mut lines).await;
        let second = read_envelope(&mut lines).await;
        assert_eq!(first.sequence_id, 1);
        assert_eq!(second.sequence_id, 2);

        // Ack only the first, then drop the connection
        write_half.write_all(b"{\"ack\":1}\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(write_half);
        drop(lines);

        // Reconnect: the unacked envelope is replayed
        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let replayed = read_envelope(&mut lines).await;
        assert_eq!(replayed.sequence_id, 2);

        write_half.write_all(b"{\"ack\":2}\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unacked_envelopes_resent_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handle = ClientHandle::spawn(
            "race_control".to_string(),
            addr.clone(),
            dir.path().join("race_control.jsonl"),
            0.5,
        );
        handle.try_send(crossing("100001"));
        // Give the worker time to bind its listener before connecting.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Same envelope shows up at least twice without an ack
        let first = read_envelope(&mut lines).await;
        let again = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let env = read_envelope(&mut lines).await;
                if env.sequence_id == first.sequence_id {
                    return env;
                }
            }
        })
        .await
        .expect("resend should repeat the envelope");
        assert_eq!(again.sequence_id, first.sequence_id);

        handle.shutdown().await;
    }
}
