//! Network source - decoder link over UDP datagrams or a TCP stream.
//!
//! The decoder resends a reading until it is acknowledged, so every valid
//! frame is ACKed back to the hardware immediately. If the uplink to the
//! server dies after the hardware ACK, the relay queue still has the
//! crossing; nothing is lost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::Sender;
use chrono::Utc;
use contracts::{CrossingEvent, NetProtocol, NetworkSettings, SourceType, TimingError};
use decoder::FrameDecoder;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::source::{send_event, SourceStatus, StopFlag};

/// Hardware acknowledgment for the decoder.
const ACK_BYTES: &[u8] = &[0x1B, 0x11];

enum NetLink {
    Udp(Arc<UdpSocket>),
    Tcp(TcpStream),
}

/// Network decoder link (UDP or TCP).
pub struct NetworkSource {
    settings: NetworkSettings,
    link: Option<NetLink>,
    connected: bool,
    reading: StopFlag,
    frames_seen: Arc<AtomicU64>,
}

impl NetworkSource {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            settings,
            link: None,
            connected: false,
            reading: Arc::new(AtomicBool::new(false)),
            frames_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn connect(&mut self) -> Result<(), TimingError> {
        let link = match self.settings.protocol {
            NetProtocol::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", self.settings.port))
                    .await
                    .map_err(|e| {
                        TimingError::channel_from(
                            format!("udp bind 0.0.0.0:{}", self.settings.port),
                            e,
                        )
                    })?;
                NetLink::Udp(Arc::new(socket))
            }
            NetProtocol::Tcp => {
                let stream =
                    TcpStream::connect((self.settings.host.as_str(), self.settings.port))
                        .await
                        .map_err(|e| {
                            TimingError::channel_from(
                                format!(
                                    "tcp connect {}:{}",
                                    self.settings.host, self.settings.port
                                ),
                                e,
                            )
                        })?;
                NetLink::Tcp(stream)
            }
        };
        info!(
            host = %self.settings.host,
            port = self.settings.port,
            protocol = ?self.settings.protocol,
            "network decoder connected"
        );
        self.link = Some(link);
        self.connected = true;
        Ok(())
    }

    pub fn start(&mut self, tx: Sender<CrossingEvent>) {
        if self.reading.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(link) = self.link.take() else {
            error!("network start without connect");
            self.reading.store(false, Ordering::SeqCst);
            return;
        };
        let endian = self.settings.endian;
        let reading = self.reading.clone();
        let frames_seen = self.frames_seen.clone();

        match link {
            NetLink::Udp(socket) => {
                tokio::spawn(async move {
                    udp_read_loop(socket, endian, reading, frames_seen, tx).await;
                });
            }
            NetLink::Tcp(stream) => {
                tokio::spawn(async move {
                    tcp_read_loop(stream, endian, reading, frames_seen, tx).await;
                });
            }
        }
    }

    pub fn stop(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            source_type: SourceType::Network,
            connected: self.connected,
            reading: self.is_reading(),
            detail: json!({
                "host": self.settings.host,
                "port": self.settings.port,
                "protocol": self.settings.protocol,
                "frames_seen": self.frames_seen.load(Ordering::Relaxed),
            }),
        }
    }
}

async fn udp_read_loop(
    socket: Arc<UdpSocket>,
    endian: contracts::Endianness,
    reading: StopFlag,
    frames_seen: Arc<AtomicU64>,
    tx: Sender<CrossingEvent>,
) {
    let mut frame_decoder = FrameDecoder::new(endian);
    let mut buf = [0u8; 2048];
    debug!("udp read loop started");

    while reading.load(Ordering::Relaxed) {
        let (n, peer) = match tokio::time::timeout(
            Duration::from_secs(1),
            socket.recv_from(&mut buf),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(error = %e, "udp receive error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            // Timeout: just re-check the stop flag
            Err(_) => continue,
        };

        let events = frame_decoder.decode_datagram(&buf[..n], Utc::now());
        if !events.is_empty() {
            frames_seen.fetch_add(events.len() as u64, Ordering::Relaxed);
            // ACK so the decoder moves on to its next reading
            if let Err(e) = socket.send_to(ACK_BYTES, peer).await {
                warn!(error = %e, "failed to ack decoder");
            }
            for event in events {
                send_event(&tx, event, "network");
            }
        }
    }
    debug!("udp read loop stopped");
}

async fn tcp_read_loop(
    mut stream: TcpStream,
    endian: contracts::Endianness,
    reading: StopFlag,
    frames_seen: Arc<AtomicU64>,
    tx: Sender<CrossingEvent>,
) {
    let mut frame_decoder = FrameDecoder::new(endian);
    let mut buf = [0u8; 2048];
    debug!("tcp read loop started");

    while reading.load(Ordering::Relaxed) {
        match stream.read(&mut buf).await {
            Ok(0) => {
                warn!("decoder closed tcp stream");
                break;
            }
            Ok(n) => {
                let events = frame_decoder.push_bytes(&buf[..n], Utc::now());
                if !events.is_empty() {
                    frames_seen.fetch_add(events.len() as u64, Ordering::Relaxed);
                    if let Err(e) = stream.write_all(ACK_BYTES).await {
                        warn!(error = %e, "failed to ack decoder");
                    }
                    for event in events {
                        send_event(&tx, event, "network");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "tcp read error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("tcp read loop stopped");
}
