//! Race / Round data model
//!
//! Plain state records shared between the lifecycle engine, the ingestion
//! handler and the CLI. Behavior (transitions, pause math, ending evaluation)
//! lives in the `race_core` crate; these structs are the frozen shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TransponderId;

pub type RaceId = u64;
pub type RoundId = u64;
pub type TeamId = u64;

/// Policy determining when and how a race concludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndingMode {
    /// Ends at the time limit; teams freeze at their last crossing before expiry
    TimeOnly,
    /// Ends once every team has crossed the line after the time limit expired
    CrossAfterTime,
    /// Each team finishes independently after completing the lap count
    CrossAfterLaps,
    /// Ends for everyone once all teams have completed the lap count
    FullLaps,
    /// Time-limited; laps crossing after expiry are discarded
    Qualifying,
    /// Time-limited; a lap already in progress at expiry still counts
    QualifyingPlus,
    /// Lap-count race that degrades to CROSS_AFTER_TIME when time runs out first
    AutoTransform,
}

/// How a race's clock is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartMode {
    /// `started` is set the moment race control hits start
    #[default]
    Immediate,
    /// Armed by race control; `started` is set by the first lap crossing
    FirstCrossing,
}

/// One suspension of the round clock. `end == None` means currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// A single race within a round.
///
/// At most one race per round has `started != None && ended == None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub id: RaceId,
    pub round_id: RoundId,
    /// Position within the round's race sequence
    pub sequence_number: u32,
    pub ending_mode: EndingMode,
    #[serde(default)]
    pub start_mode: StartMode,
    /// Race-level time limit override in seconds (highest precedence)
    pub time_limit_override: Option<f64>,
    /// Race-level lap count override (highest precedence)
    pub lap_count_override: Option<u32>,
    /// When true, crossings recorded while the round is paused stay valid
    #[serde(default)]
    pub count_crossings_during_suspension: bool,
    /// Pre-race check passed
    #[serde(default)]
    pub ready: bool,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Race whose transponder assignments this race inherits when it has none
    pub depends_on_race: Option<RaceId>,
}

/// A round: owns its races and the round-scoped pause windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Non-overlapping, time-ordered; at most one window open
    #[serde(default)]
    pub pauses: Vec<PauseWindow>,
    /// Round-level time limit adjustment in seconds (middle precedence)
    pub time_limit_adjustment: Option<f64>,
    /// Round-level lap count adjustment (middle precedence)
    pub lap_count_adjustment: Option<u32>,
}

/// Championship-level ending parameter defaults (lowest configured precedence).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChampionshipDefaults {
    pub time_limit: Option<f64>,
    pub lap_count: Option<u32>,
}

/// Transponders assigned to one team for one race.
///
/// Teams often run two transponders on the same kart for redundancy; within a
/// race a transponder id maps to at most one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransponderAssignment {
    pub race_id: RaceId,
    pub team_id: TeamId,
    pub kart_number: u32,
    pub transponder_ids: Vec<TransponderId>,
}

/// A registered team as the ingestion core needs to know it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamEntry {
    pub team_id: TeamId,
    pub number: u32,
    /// Heaviest registered driver weight in kg, used by the pre-race check
    pub driver_weight_kg: Option<f64>,
    #[serde(default)]
    pub retired: bool,
}
