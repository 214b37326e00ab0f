//! In-memory reference implementation of the storage boundary.

use std::collections::BTreeMap;

use chrono::Duration;
use contracts::{LapCrossing, LapStore, RaceId, TeamId, TimingError};
use tracing::debug;

/// In-memory [`LapStore`].
///
/// The production deployment puts a database behind the same trait; tests and
/// the bundled server use this.
#[derive(Debug, Default)]
pub struct MemoryLapStore {
    crossings: BTreeMap<u64, LapCrossing>,
    next_id: u64,
}

impl MemoryLapStore {
    pub fn new() -> Self {
        Self {
            crossings: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.crossings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crossings.is_empty()
    }
}

impl LapStore for MemoryLapStore {
    fn insert(&mut self, mut crossing: LapCrossing) -> Result<LapCrossing, TimingError> {
        crossing.id = self.next_id;
        self.next_id += 1;
        self.crossings.insert(crossing.id, crossing.clone());
        Ok(crossing)
    }

    fn get(&self, id: u64) -> Option<LapCrossing> {
        self.crossings.get(&id).cloned()
    }

    fn set_suspicious(&mut self, id: u64, suspicious: bool) -> Result<(), TimingError> {
        let crossing = self
            .crossings
            .get_mut(&id)
            .ok_or_else(|| TimingError::invariant(format!("crossing {id} not found")))?;
        crossing.is_suspicious = suspicious;
        Ok(())
    }

    fn invalidate(&mut self, id: u64) -> Result<(), TimingError> {
        let crossing = self
            .crossings
            .get_mut(&id)
            .ok_or_else(|| TimingError::invariant(format!("crossing {id} not found")))?;
        crossing.is_valid = false;
        Ok(())
    }

    fn team_crossings(&self, race_id: RaceId, team_id: TeamId) -> Vec<LapCrossing> {
        let mut result: Vec<LapCrossing> = self
            .crossings
            .values()
            .filter(|c| c.race_id == race_id && c.team_id == team_id)
            .cloned()
            .collect();
        result.sort_by_key(|c| (c.lap_number, c.timestamp));
        result
    }

    fn race_crossings(&self, race_id: RaceId) -> Vec<LapCrossing> {
        let mut result: Vec<LapCrossing> = self
            .crossings
            .values()
            .filter(|c| c.race_id == race_id)
            .cloned()
            .collect();
        result.sort_by_key(|c| c.timestamp);
        result
    }

    fn split(
        &mut self,
        id: u64,
        first_lap_time: f64,
    ) -> Result<(LapCrossing, LapCrossing), TimingError> {
        // Validate everything before any mutation so the operation is
        // all-or-nothing.
        let original = self
            .crossings
            .get(&id)
            .cloned()
            .ok_or_else(|| TimingError::invariant(format!("crossing {id} not found")))?;
        let total = original.lap_time.ok_or_else(|| {
            TimingError::invariant(format!("crossing {id} has no lap time to split"))
        })?;
        if !(0.0..total).contains(&first_lap_time) || first_lap_time <= 0.0 {
            return Err(TimingError::invariant(format!(
                "split point {first_lap_time}s outside (0, {total})s"
            )));
        }

        let second_lap_time = total - first_lap_time;
        let mid_timestamp =
            original.timestamp - Duration::milliseconds((second_lap_time * 1000.0).round() as i64);

        let first = LapCrossing {
            id: 0,
            timestamp: mid_timestamp,
            lap_time: Some(first_lap_time),
            is_suspicious: false,
            was_split: true,
            ..original.clone()
        };
        let second = LapCrossing {
            id: 0,
            lap_number: original.lap_number + 1,
            lap_time: Some(second_lap_time),
            is_suspicious: false,
            was_split: true,
            ..original.clone()
        };

        // Shift every later lap of this team up by one
        let later_ids: Vec<u64> = self
            .crossings
            .values()
            .filter(|c| {
                c.race_id == original.race_id
                    && c.team_id == original.team_id
                    && c.lap_number > original.lap_number
            })
            .map(|c| c.id)
            .collect();
        for later_id in later_ids {
            if let Some(c) = self.crossings.get_mut(&later_id) {
                c.lap_number += 1;
            }
        }

        self.crossings.remove(&id);
        let first = self.insert(first)?;
        let second = self.insert(second)?;

        debug!(
            original = id,
            first = first.id,
            second = second.id,
            "crossing split into two laps"
        );
        Ok((first, second))
    }
}
