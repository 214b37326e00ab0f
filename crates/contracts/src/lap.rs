//! LapCrossing - Ingestion output
//!
//! The durable record of one validated pass. Created by the ingestion handler,
//! mutated only by the explicit split operation, removed only by invalidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RaceId, TeamId, TransponderId};

/// A recorded lap crossing for a team in a race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapCrossing {
    /// Store-assigned id
    pub id: u64,
    pub race_id: RaceId,
    pub team_id: TeamId,
    pub transponder_id: TransponderId,
    pub timestamp: DateTime<Utc>,
    /// Decoder raw time carried through for diagnostics
    pub raw_time: f64,
    /// 1-based; monotonic per (race, team) over valid crossings
    pub lap_number: u32,
    /// Seconds; None for a first passage with no reference point
    pub lap_time: Option<f64>,
    /// Anomalously long lap, flagged for manual review
    #[serde(default)]
    pub is_suspicious: bool,
    /// Invalidated crossings stay stored but count for nothing
    #[serde(default = "default_true")]
    pub is_valid: bool,
    /// Produced by splitting another crossing
    #[serde(default)]
    pub was_split: bool,
}

fn default_true() -> bool {
    true
}

impl LapCrossing {
    /// Counts toward lap totals and standings.
    pub fn counts(&self) -> bool {
        self.is_valid
    }
}
