//! Station-to-server wire protocol and relay envelope
//!
//! Text-encoded messages exchanged over the persistent station channel, plus
//! the durable envelope format used by relay queues. Every message carries an
//! `hmac_signature` field on the wire; signing and verification are in
//! [`crate::auth`] and operate on the serialized form, so the types here model
//! only the payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CrossingEvent, TimingMode, TransponderAssignment};

/// Timing source plugin kinds - a fixed closed set, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Synthetic crossing generator for testing
    Simulator,
    /// Stream-oriented serial decoder link
    Serial,
    /// Datagram or stream network decoder link
    Network,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulator => "simulator",
            Self::Serial => "serial",
            Self::Network => "network",
        }
    }
}

/// Messages sent from a timing station to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationMessage {
    /// Handshake sent once per connection, before any crossing
    Connected {
        plugin_type: SourceType,
        timing_mode: TimingMode,
        rollover_seconds: f64,
        timestamp: DateTime<Utc>,
    },
    /// One buffered crossing; `sequence_id` is the relay queue sequence the
    /// server must ack
    LapCrossing {
        sequence_id: u64,
        #[serde(flatten)]
        event: CrossingEvent,
    },
    /// Operator-visible condition that is not worth a crossing record
    Warning { message: String },
    /// Reply to a server command
    Response {
        response: String,
        #[serde(default)]
        status: serde_json::Value,
    },
}

/// Messages sent from the server to a timing station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Cumulative acknowledgment: everything up to and including
    /// `sequence_id` has been processed
    Ack { sequence_id: u64 },
    /// Control command
    Command {
        #[serde(flatten)]
        command: StationCommand,
    },
}

/// Server-to-station control commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StationCommand {
    StartRace { race_id: u64 },
    EndRace { race_id: u64 },
    UpdateAssignments { assignments: Vec<TransponderAssignment> },
    GetStatus,
}

/// Durable entry in a relay queue.
///
/// Owned exclusively by one queue; removed only after the consumer acks this
/// sequence id or a higher one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Monotonically increasing per queue, never reused across restarts
    pub sequence_id: u64,
    pub payload: RelayPayload,
}

/// What a relay queue carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayPayload {
    Crossing(CrossingEvent),
    /// Non-crossing control traffic that still needs reliable delivery
    Control { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lap_crossing_flattens_event_fields() {
        let msg = StationMessage::LapCrossing {
            sequence_id: 7,
            event: CrossingEvent {
                transponder_id: "023066".into(),
                timestamp: Utc::now(),
                raw_time: 12.5,
                signal_strength: 95,
                source_sequence: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "lap_crossing");
        assert_eq!(value["transponder_id"], "023066");
        assert_eq!(value["sequence_id"], 7);
    }

    #[test]
    fn test_command_tags() {
        let msg = ServerMessage::Command {
            command: StationCommand::GetStatus,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["command"], "get_status");

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_ack_round_trip() {
        let json = r#"{"type":"ack","sequence_id":42}"#;
        let parsed: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, ServerMessage::Ack { sequence_id: 42 });
    }
}
