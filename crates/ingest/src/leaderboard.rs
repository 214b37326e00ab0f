//! Leaderboard aggregation - standings recomputed from persisted laps.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use contracts::{LapStore, RaceId, StandingEntry, TeamEntry};

/// Compute current standings for a race.
///
/// `cutoff` freezes each team at its last crossing before that instant
/// (TIME_ONLY races). Ranking: most valid laps first, earlier last-crossing
/// breaks ties (you were ahead on the road).
pub fn compute_standings<S: LapStore>(
    store: &S,
    race_id: RaceId,
    teams: &[TeamEntry],
    cutoff: Option<DateTime<Utc>>,
) -> Vec<StandingEntry> {
    let mut entries: Vec<StandingEntry> = teams
        .iter()
        .filter(|t| !t.retired)
        .map(|team| {
            let crossings: Vec<_> = store
                .team_crossings(race_id, team.team_id)
                .into_iter()
                .filter(|c| c.is_valid)
                .filter(|c| cutoff.map(|cut| c.timestamp <= cut).unwrap_or(true))
                .collect();
            let best_lap = crossings
                .iter()
                .filter_map(|c| c.lap_time)
                .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            StandingEntry {
                position: 0,
                team_id: team.team_id,
                team_number: team.number,
                laps_completed: crossings.len() as u32,
                last_crossing: crossings.last().map(|c| c.timestamp),
                best_lap,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.laps_completed.cmp(&a.laps_completed).then_with(|| {
            match (a.last_crossing, b.last_crossing) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.team_number.cmp(&b.team_number),
            }
        })
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.position = i as u32 + 1;
    }
    entries
}

/// Debounces standings recomputation: crossings arrive in bursts and the
/// leaderboard only needs to move about once per second.
#[derive(Debug)]
pub struct LeaderboardAggregator {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl LeaderboardAggregator {
    pub fn new(min_interval_secs: f64) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(min_interval_secs.max(0.0)),
            last_emit: None,
        }
    }

    /// True when enough time has passed to recompute; records the emission.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
