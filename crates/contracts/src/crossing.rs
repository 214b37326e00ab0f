//! CrossingEvent - Decoder output
//!
//! One transponder detected passing the timing loop. Immutable once emitted;
//! exists only in transit between decoder, relay queue and server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TransponderId;

/// A single transponder crossing as normalized by a frame decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    /// Transponder that triggered the loop
    pub transponder_id: TransponderId,

    /// Wall-clock time the frame was received
    pub timestamp: DateTime<Utc>,

    /// Decoder-reported time in seconds (meaning depends on timing mode)
    pub raw_time: f64,

    /// Loop signal strength as reported by the decoder (0 when unknown)
    pub signal_strength: u16,

    /// Sequence counter from the decoder frame, when the hardware provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sequence: Option<u64>,
}

/// Byte order mode of a decoder link.
///
/// Some serial decoder wirings deliver every byte bit-reversed; the frame
/// decoder undoes that before scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    /// Bytes arrive as sent
    #[default]
    Normal,
    /// Each byte arrives bit-reversed
    #[serde(rename = "bitrev")]
    BitReversed,
}

/// Raw-time interpretation modes supported by decoder hardware.
///
/// The server computes lap times from wall-clock timestamps; the mode is
/// carried in the station handshake so operators can see what the decoder
/// clock means, and so the simulator can shape realistic raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// raw_time is this lap's duration (zero on first passage)
    Interval,
    /// raw_time is cumulative seconds since decoder start
    #[default]
    Duration,
    /// raw_time is seconds since midnight, wrapping at 86400
    TimeOfDay,
    /// raw_time is cumulative seconds modulo a configured rollover
    OwnTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossing_round_trips_without_source_sequence() {
        let event = CrossingEvent {
            transponder_id: "023066".into(),
            timestamp: Utc::now(),
            raw_time: 289673.016,
            signal_strength: 0,
            source_sequence: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("source_sequence"));
        let parsed: CrossingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_timing_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&TimingMode::TimeOfDay).unwrap(),
            "\"time_of_day\""
        );
    }
}
