//! Ending-mode evaluation.
//!
//! Given a race's resolved time limit / lap count and its ending mode,
//! decides whether the race should auto-finish and what "finished" means for
//! each team. Evaluated after every lap crossing and on timer ticks; the
//! manual End Race command always short-circuits this.

use chrono::{DateTime, Utc};
use contracts::{ChampionshipDefaults, EndingMode, Race, Round, TeamId};
use tracing::instrument;

use crate::timed::TimedEntity;
use crate::RaceTimer;

/// Hard-coded fallback when no level of the configuration chain sets a limit.
pub const FALLBACK_TIME_LIMIT: f64 = 4.0 * 3600.0;
pub const FALLBACK_LAP_COUNT: u32 = 0;

/// Resolved ending parameters for one race.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndingParams {
    /// Seconds of pause-adjusted running time
    pub time_limit: f64,
    pub lap_count: u32,
}

/// Resolve the parameter precedence chain:
/// race override > round adjustment > championship default > fallback.
pub fn resolve_params(
    race: &Race,
    round: &Round,
    championship: &ChampionshipDefaults,
) -> EndingParams {
    let time_limit = race
        .time_limit_override
        .or(round.time_limit_adjustment)
        .or(championship.time_limit)
        .unwrap_or(FALLBACK_TIME_LIMIT);
    let lap_count = race
        .lap_count_override
        .or(round.lap_count_adjustment)
        .or(championship.lap_count)
        .unwrap_or(FALLBACK_LAP_COUNT);
    EndingParams {
        time_limit,
        lap_count,
    }
}

/// Per-team progress snapshot fed to the evaluator.
///
/// Built by the ingestion side from valid crossings only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamProgress {
    pub team_id: TeamId,
    pub laps_completed: u32,
    pub last_crossing: Option<DateTime<Utc>>,
    /// Timestamp of the crossing that completed the resolved lap count
    pub reached_lap_count_at: Option<DateTime<Utc>>,
}

impl TeamProgress {
    fn crossed_after(&self, instant: DateTime<Utc>) -> bool {
        self.last_crossing.map(|t| t > instant).unwrap_or(false)
    }
}

/// What the evaluator concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishDecision {
    /// Race keeps running
    Pending,
    /// These teams are finished; the race keeps running for the others
    /// (CROSS_AFTER_LAPS only)
    TeamsFinished(Vec<TeamId>),
    /// The whole race is over. `cutoff` is set when standings must freeze at
    /// a wall-clock instant (TIME_ONLY's expiry) instead of at race end.
    RaceFinished { cutoff: Option<DateTime<Utc>> },
}

/// Whether a crossing should count, for modes that discard late laps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingDisposition {
    Count,
    /// Record for audit but mark invalid
    Discard,
}

/// Everything the evaluator looks at.
#[derive(Debug, Clone, Copy)]
pub struct EvalInput<'a> {
    pub race: &'a Race,
    pub round: &'a Round,
    pub params: EndingParams,
    pub teams: &'a [TeamProgress],
    pub now: DateTime<Utc>,
}

/// Wall-clock instant at which the race's pause-adjusted elapsed time reaches
/// `limit` seconds.
///
/// Returns None when the race has not started, or when an open pause stops
/// the clock before the limit is reached (the expiry instant is unknowable
/// until the round resumes).
pub fn expiry_instant(race: &Race, round: &Round, limit: f64) -> Option<DateTime<Utc>> {
    let started = race.started?;
    let mut remaining = limit;
    let mut cursor = started;

    for pause in &round.pauses {
        let pause_start = pause.start.max(cursor);
        if let Some(pause_end) = pause.end {
            if pause_end <= cursor {
                continue;
            }
            let available = (pause_start - cursor).as_seconds_f64();
            if available >= remaining {
                break;
            }
            remaining -= available;
            cursor = pause_end;
        } else {
            // Open pause: only reachable if the limit lands before it
            let available = (pause_start - cursor).as_seconds_f64();
            if available >= remaining {
                break;
            }
            return None;
        }
    }

    Some(cursor + chrono::Duration::milliseconds((remaining * 1000.0).round() as i64))
}

/// Evaluate the race-finish condition.
#[instrument(name = "ending_evaluate", skip_all, fields(race_id = input.race.id, mode = ?input.race.ending_mode))]
pub fn evaluate(input: EvalInput<'_>) -> FinishDecision {
    let race = input.race;
    if race.started.is_none() || race.ended.is_some() {
        return FinishDecision::Pending;
    }

    let timer = RaceTimer::new(race, input.round, Some(input.params.time_limit));
    let elapsed = timer.elapsed(input.now);
    let expired = elapsed >= input.params.time_limit;

    match race.ending_mode {
        EndingMode::TimeOnly => {
            if expired {
                FinishDecision::RaceFinished {
                    cutoff: expiry_instant(race, input.round, input.params.time_limit),
                }
            } else {
                FinishDecision::Pending
            }
        }

        EndingMode::Qualifying | EndingMode::QualifyingPlus => {
            // Late-lap discarding already happened at ingestion; the session
            // itself just runs out of time.
            if expired {
                FinishDecision::RaceFinished { cutoff: None }
            } else {
                FinishDecision::Pending
            }
        }

        EndingMode::CrossAfterTime => evaluate_cross_after_time(&input, expired),

        EndingMode::CrossAfterLaps => evaluate_cross_after_laps(&input),

        EndingMode::FullLaps => {
            if all_teams_reached(input.teams, input.params.lap_count) {
                FinishDecision::RaceFinished { cutoff: None }
            } else {
                FinishDecision::Pending
            }
        }

        EndingMode::AutoTransform => {
            // Lap target first; on expiry the race degrades to
            // CROSS_AFTER_TIME for the remainder.
            if all_teams_reached(input.teams, input.params.lap_count) {
                FinishDecision::RaceFinished { cutoff: None }
            } else if expired {
                evaluate_cross_after_time(&input, true)
            } else {
                FinishDecision::Pending
            }
        }
    }
}

fn evaluate_cross_after_time(input: &EvalInput<'_>, expired: bool) -> FinishDecision {
    if !expired || input.teams.is_empty() {
        return FinishDecision::Pending;
    }
    let Some(expiry) = expiry_instant(input.race, input.round, input.params.time_limit) else {
        return FinishDecision::Pending;
    };

    let leader = input
        .teams
        .iter()
        .max_by_key(|t| t.laps_completed)
        .expect("teams is non-empty");
    if !leader.crossed_after(expiry) {
        return FinishDecision::Pending;
    }
    if input.teams.iter().all(|t| t.crossed_after(expiry)) {
        FinishDecision::RaceFinished { cutoff: None }
    } else {
        FinishDecision::Pending
    }
}

fn evaluate_cross_after_laps(input: &EvalInput<'_>) -> FinishDecision {
    let lap_count = input.params.lap_count;
    let finished: Vec<TeamId> = input
        .teams
        .iter()
        .filter(|t| {
            t.laps_completed >= lap_count
                && t.reached_lap_count_at
                    .map(|reached| t.crossed_after(reached))
                    .unwrap_or(false)
        })
        .map(|t| t.team_id)
        .collect();

    // The caller ends the race once the finished set covers every team; the
    // evaluator only ever reports per-team finishes for this mode.
    if finished.is_empty() {
        FinishDecision::Pending
    } else {
        FinishDecision::TeamsFinished(finished)
    }
}

fn all_teams_reached(teams: &[TeamProgress], lap_count: u32) -> bool {
    !teams.is_empty() && teams.iter().all(|t| t.laps_completed >= lap_count)
}

/// Decide whether a new crossing counts under the race's ending mode.
///
/// `lap_started_at` is the previous accepted crossing for the team (or the
/// race start for a first passage) - the instant the lap now being completed
/// began.
pub fn crossing_disposition(
    race: &Race,
    round: &Round,
    params: EndingParams,
    lap_started_at: Option<DateTime<Utc>>,
    crossing_at: DateTime<Utc>,
) -> CrossingDisposition {
    let expiry = match race.ending_mode {
        EndingMode::Qualifying | EndingMode::QualifyingPlus => {
            match expiry_instant(race, round, params.time_limit) {
                Some(t) => t,
                None => return CrossingDisposition::Count,
            }
        }
        _ => return CrossingDisposition::Count,
    };

    if crossing_at <= expiry {
        return CrossingDisposition::Count;
    }

    match race.ending_mode {
        // Session over: late laps never count
        EndingMode::Qualifying => CrossingDisposition::Discard,
        // A lap already underway at expiry is allowed to complete
        EndingMode::QualifyingPlus => {
            let started_before_expiry = lap_started_at
                .or(race.started)
                .map(|t| t <= expiry)
                .unwrap_or(false);
            if started_before_expiry {
                CrossingDisposition::Count
            } else {
                CrossingDisposition::Discard
            }
        }
        _ => CrossingDisposition::Count,
    }
}
