//! TimedEntity - shared timer capability for rounds and races
//!
//! Pauses are round-scoped: one pause window stops the clock of every race in
//! the round. A race's elapsed time is its own [started, now-or-ended] window
//! minus the portion overlapped by any pause window (interval intersection),
//! so a pause begun during one race and ended during a later one is split
//! correctly between both.

use chrono::{DateTime, Utc};
use contracts::{PauseWindow, Race, Round};

/// Seconds of `[window_start, window_end]` covered by pause windows.
///
/// An open pause (`end == None`) is clipped at `window_end`.
pub fn paused_overlap(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    pauses: &[PauseWindow],
) -> f64 {
    let mut total = 0.0;
    for pause in pauses {
        let pause_end = pause.end.unwrap_or(window_end);
        let start = pause.start.max(window_start);
        let end = pause_end.min(window_end);
        if end > start {
            total += (end - start).as_seconds_f64();
        }
    }
    total
}

/// Timer capability shared by rounds and races.
pub trait TimedEntity {
    fn started(&self) -> Option<DateTime<Utc>>;
    fn ended(&self) -> Option<DateTime<Utc>>;

    /// Configured running time in seconds, when the entity has one.
    fn duration(&self) -> Option<f64>;

    /// Pause windows affecting this entity's clock.
    fn pauses(&self) -> &[PauseWindow];

    /// Clock currently stopped by an open pause window.
    fn is_paused(&self) -> bool {
        self.pauses().iter().any(|p| p.end.is_none())
    }

    /// Pause-adjusted running time in seconds at `now` (or at end).
    fn elapsed(&self, now: DateTime<Utc>) -> f64 {
        let Some(started) = self.started() else {
            return 0.0;
        };
        let until = self.ended().unwrap_or(now);
        if until <= started {
            return 0.0;
        }
        let gross = (until - started).as_seconds_f64();
        gross - paused_overlap(started, until, self.pauses())
    }

    /// Seconds left before the configured duration runs out.
    fn remaining(&self, now: DateTime<Utc>) -> Option<f64> {
        self.duration().map(|d| (d - self.elapsed(now)).max(0.0))
    }
}

impl TimedEntity for Round {
    fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    fn ended(&self) -> Option<DateTime<Utc>> {
        self.ended
    }

    fn duration(&self) -> Option<f64> {
        self.time_limit_adjustment
    }

    fn pauses(&self) -> &[PauseWindow] {
        &self.pauses
    }
}

/// A race viewed together with its round's pause windows and resolved limit.
///
/// Races do not own pause windows, so the timer capability needs both halves.
#[derive(Debug, Clone, Copy)]
pub struct RaceTimer<'a> {
    race: &'a Race,
    round: &'a Round,
    time_limit: Option<f64>,
}

impl<'a> RaceTimer<'a> {
    pub fn new(race: &'a Race, round: &'a Round, time_limit: Option<f64>) -> Self {
        Self {
            race,
            round,
            time_limit,
        }
    }

    pub fn race(&self) -> &Race {
        self.race
    }
}

impl TimedEntity for RaceTimer<'_> {
    fn started(&self) -> Option<DateTime<Utc>> {
        self.race.started
    }

    fn ended(&self) -> Option<DateTime<Utc>> {
        self.race.ended
    }

    fn duration(&self) -> Option<f64> {
        self.time_limit
    }

    fn pauses(&self) -> &[PauseWindow] {
        &self.round.pauses
    }
}
