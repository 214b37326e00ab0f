//! Serial source - stream-oriented decoder link over a serial port.
//!
//! Reads raw bytes from the port and feeds them through the shared frame
//! decoder; partial frames are buffered across reads. Read errors back off
//! briefly and keep going - a flaky serial link must never kill the daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::Sender;
use chrono::Utc;
use contracts::{CrossingEvent, SerialSettings, SourceType, TimingError};
use decoder::FrameDecoder;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use crate::source::{send_event, SourceStatus, StopFlag};

/// Serial decoder link.
pub struct SerialSource {
    settings: SerialSettings,
    stream: Option<SerialStream>,
    reading: StopFlag,
}

impl SerialSource {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            stream: None,
            reading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(&mut self) -> Result<(), TimingError> {
        let stream = tokio_serial::new(&self.settings.device, self.settings.baud)
            .open_native_async()
            .map_err(|e| {
                TimingError::channel_from(
                    format!(
                        "serial open {} @ {} baud",
                        self.settings.device, self.settings.baud
                    ),
                    e,
                )
            })?;
        info!(
            device = %self.settings.device,
            baud = self.settings.baud,
            endian = ?self.settings.endian,
            "serial decoder connected"
        );
        self.stream = Some(stream);
        Ok(())
    }

    pub fn start(&mut self, tx: Sender<CrossingEvent>) {
        if self.reading.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(stream) = self.stream.take() else {
            error!("serial start without connect");
            self.reading.store(false, Ordering::SeqCst);
            return;
        };
        let endian = self.settings.endian;
        let reading = self.reading.clone();

        tokio::spawn(async move {
            read_loop(stream, endian, reading, tx).await;
        });
    }

    pub fn stop(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            source_type: SourceType::Serial,
            connected: self.stream.is_some() || self.is_reading(),
            reading: self.is_reading(),
            detail: json!({
                "device": self.settings.device,
                "baud": self.settings.baud,
                "endian": self.settings.endian,
            }),
        }
    }
}

async fn read_loop(
    mut stream: SerialStream,
    endian: contracts::Endianness,
    reading: StopFlag,
    tx: Sender<CrossingEvent>,
) {
    let mut frame_decoder = FrameDecoder::new(endian);
    let mut buf = [0u8; 512];
    debug!("serial read loop started");

    while reading.load(Ordering::Relaxed) {
        match stream.read(&mut buf).await {
            Ok(0) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(n) => {
                for event in frame_decoder.push_bytes(&buf[..n], Utc::now()) {
                    send_event(&tx, event, "serial");
                }
            }
            Err(e) => {
                error!(error = %e, "serial read error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("serial read loop stopped");
}
