//! LapStore trait - storage collaborator boundary
//!
//! The core needs create/read/update for lap crossings with the documented
//! invariants; it does not define the storage engine. The reference
//! implementation is the in-memory store in the `ingest` crate.

use crate::{LapCrossing, RaceId, TeamId, TimingError};

/// Persistent lap crossing storage.
///
/// Implementations must keep `lap_number` monotonic per (race, team) over
/// valid crossings and make `split` atomic: either both replacement records
/// exist and the original is gone, or nothing changed.
pub trait LapStore: Send {
    /// Persist a crossing. The store assigns the id (the incoming `id` field
    /// is ignored) and returns the stored record.
    fn insert(&mut self, crossing: LapCrossing) -> Result<LapCrossing, TimingError>;

    /// Fetch one crossing by id.
    fn get(&self, id: u64) -> Option<LapCrossing>;

    /// Flag a crossing for manual review.
    fn set_suspicious(&mut self, id: u64, suspicious: bool) -> Result<(), TimingError>;

    /// Invalidate a crossing. Invalidated records stay stored.
    fn invalidate(&mut self, id: u64) -> Result<(), TimingError>;

    /// All crossings for a team in a race, ordered by lap_number.
    fn team_crossings(&self, race_id: RaceId, team_id: TeamId) -> Vec<LapCrossing>;

    /// All crossings in a race.
    fn race_crossings(&self, race_id: RaceId) -> Vec<LapCrossing>;

    /// Replace one crossing by two whose lap times sum to the original,
    /// shifting every subsequent lap_number for that team by one.
    ///
    /// `first_lap_time` is the duration of the inserted earlier lap; the
    /// second lap keeps the original crossing timestamp.
    fn split(
        &mut self,
        id: u64,
        first_lap_time: f64,
    ) -> Result<(LapCrossing, LapCrossing), TimingError>;
}
