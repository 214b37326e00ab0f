//! Timing source plugins - a fixed closed set with tagged dispatch.
//!
//! Plugin selection happens once at startup from the configured type string;
//! after that every call goes through this enum, not trait objects.

use std::sync::Arc;

use async_channel::{Sender, TrySendError};
use contracts::{CrossingEvent, SourceType, TimingError};
use serde_json::Value;
use tracing::{trace, warn};

use crate::network::NetworkSource;
use crate::serial::SerialSource;
use crate::simulator::SimulatorSource;

/// Runtime status of a source, shipped in `get_status` responses.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub source_type: SourceType,
    pub connected: bool,
    pub reading: bool,
    /// Source-specific fields (device, host, transponder count, ...)
    pub detail: Value,
}

/// The closed set of timing sources.
pub enum SourcePlugin {
    Simulator(SimulatorSource),
    Serial(SerialSource),
    Network(NetworkSource),
}

impl SourcePlugin {
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::Simulator(_) => SourceType::Simulator,
            Self::Serial(_) => SourceType::Serial,
            Self::Network(_) => SourceType::Network,
        }
    }

    /// Establish the connection to the hardware (or set up the simulation).
    pub async fn connect(&mut self) -> Result<(), TimingError> {
        match self {
            Self::Simulator(s) => s.connect().await,
            Self::Serial(s) => s.connect().await,
            Self::Network(s) => s.connect().await,
        }
    }

    /// Begin reading crossings into `tx`. Reading runs on its own task and
    /// is independent of the uplink state.
    pub fn start(&mut self, tx: Sender<CrossingEvent>) {
        match self {
            Self::Simulator(s) => s.start(tx),
            Self::Serial(s) => s.start(tx),
            Self::Network(s) => s.start(tx),
        }
    }

    /// Stop reading.
    pub fn stop(&self) {
        match self {
            Self::Simulator(s) => s.stop(),
            Self::Serial(s) => s.stop(),
            Self::Network(s) => s.stop(),
        }
    }

    pub fn is_reading(&self) -> bool {
        match self {
            Self::Simulator(s) => s.is_reading(),
            Self::Serial(s) => s.is_reading(),
            Self::Network(s) => s.is_reading(),
        }
    }

    pub fn status(&self) -> SourceStatus {
        match self {
            Self::Simulator(s) => s.status(),
            Self::Serial(s) => s.status(),
            Self::Network(s) => s.status(),
        }
    }
}

/// Hand a crossing from a read loop to the queue writer without blocking.
///
/// The channel is bounded; when the writer cannot keep up the event is
/// dropped and counted rather than stalling the frame-read loop.
pub fn send_event(tx: &Sender<CrossingEvent>, event: CrossingEvent, source: &str) {
    match tx.try_send(event) {
        Ok(()) => {
            trace!(source, "crossing queued");
        }
        Err(TrySendError::Full(event)) => {
            metrics::counter!("station_crossings_dropped_total").increment(1);
            warn!(
                source,
                transponder_id = %event.transponder_id,
                "queue writer backlogged, crossing dropped"
            );
        }
        Err(TrySendError::Closed(_)) => {
            warn!(source, "crossing channel closed");
        }
    }
}

/// Shared stop flag handed to read loops.
pub(crate) type StopFlag = Arc<std::sync::atomic::AtomicBool>;
