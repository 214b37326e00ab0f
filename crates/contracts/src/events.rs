//! Broadcast events - the core's output boundary
//!
//! Delivered over the server's duplex channel to leaderboard and race-control
//! consumers. Not part of the write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RaceId, TeamId};

/// Events broadcast to UI consumers after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceEvent {
    /// A crossing was recorded
    RaceLapUpdate {
        race_id: RaceId,
        team_number: u32,
        lap_number: u32,
        lap_time: Option<f64>,
        is_suspicious: bool,
        crossing_id: u64,
    },
    /// Recomputed standings (debounced)
    StandingsUpdate {
        race_id: RaceId,
        standings: Vec<StandingEntry>,
    },
    /// The race concluded; `team_id` is set when a single team finished
    /// independently (CROSS_AFTER_LAPS), None when the whole race ended
    RaceFinished {
        race_id: RaceId,
        team_id: Option<TeamId>,
    },
    /// Operator warning (unknown transponder, suspicious lap, ...)
    Warning { message: String },
}

/// One row of a leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub position: u32,
    pub team_id: TeamId,
    pub team_number: u32,
    pub laps_completed: u32,
    pub last_crossing: Option<DateTime<Utc>>,
    /// Best valid lap in seconds
    pub best_lap: Option<f64>,
}
