//! Round / race lifecycle state machine.
//!
//! State transitions: `Initial -> Ready (pre-check) -> Running
//! [-> Paused -> Running] -> Ended`. Pauses are round-scoped. Invalid
//! transitions are rejected with [`LifecycleError`] and leave state unchanged.

use chrono::{DateTime, Utc};
use contracts::{
    PauseWindow, Race, RaceId, Round, StartMode, TeamEntry, TimingError, TransponderAssignment,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Driver weights outside this range fail the pre-race plausibility check.
const MIN_DRIVER_WEIGHT_KG: f64 = 30.0;
const MAX_DRIVER_WEIGHT_KG: f64 = 200.0;

/// Grace periods for undoing a start or a resume.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Seconds after Start during which False Start is allowed
    pub false_start_grace: f64,
    /// Seconds after Resume during which False Restart is allowed
    pub false_restart_grace: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            false_start_grace: 15.0,
            false_restart_grace: 15.0,
        }
    }
}

/// Rejected lifecycle transition. State is never modified on error.
#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("race {0} not found in round")]
    UnknownRace(RaceId),

    #[error("race {race_id} pre-check failed: {reason}")]
    PrecheckFailed { race_id: RaceId, reason: String },

    #[error("race {0} is not ready")]
    NotReady(RaceId),

    #[error("race {0} already started")]
    AlreadyStarted(RaceId),

    #[error("race {0} has not started")]
    NotStarted(RaceId),

    #[error("race {0} already ended")]
    AlreadyEnded(RaceId),

    #[error("another race ({0}) is still active")]
    AnotherRaceActive(RaceId),

    #[error("round is not running")]
    RoundNotRunning,

    #[error("round is already paused")]
    AlreadyPaused,

    #[error("round is not paused")]
    NotPaused,

    #[error("grace period expired: {elapsed:.1}s > {grace:.1}s")]
    GraceExpired { elapsed: f64, grace: f64 },

    #[error("no pause window to reopen")]
    NoPauseToReopen,

    #[error(transparent)]
    Invariant(#[from] TimingError),
}

/// Owned lifecycle state for one round and its races.
///
/// This is the single mutable home of round/race timing state; the ingestion
/// engine and race control drive it through explicit methods and read it back
/// through accessors, never through ambient globals.
#[derive(Debug)]
pub struct RoundState {
    round: Round,
    races: Vec<Race>,
    config: LifecycleConfig,
}

impl RoundState {
    pub fn new(round: Round, mut races: Vec<Race>) -> Self {
        races.sort_by_key(|r| r.sequence_number);
        Self {
            round,
            races,
            config: LifecycleConfig::default(),
        }
    }

    pub fn with_config(round: Round, races: Vec<Race>, config: LifecycleConfig) -> Self {
        let mut state = Self::new(round, races);
        state.config = config;
        state
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn races(&self) -> &[Race] {
        &self.races
    }

    pub fn race(&self, race_id: RaceId) -> Option<&Race> {
        self.races.iter().find(|r| r.id == race_id)
    }

    /// The race currently running: `started` set, `ended` not.
    pub fn active_race(&self) -> Option<&Race> {
        self.races
            .iter()
            .find(|r| r.started.is_some() && r.ended.is_none())
    }

    /// The next race awaiting start, by sequence order.
    pub fn upcoming_race(&self) -> Option<&Race> {
        self.races
            .iter()
            .find(|r| r.started.is_none() && r.ended.is_none())
    }

    pub fn is_paused(&self) -> bool {
        self.round.pauses.iter().any(|p| p.end.is_none())
    }

    /// Pre-race check: every non-retired team needs a transponder assignment
    /// for this race and a registered driver of plausible weight.
    ///
    /// On success the race becomes Ready.
    #[instrument(name = "lifecycle_precheck", skip(self, teams, assignments), fields(race_id))]
    pub fn run_precheck(
        &mut self,
        race_id: RaceId,
        teams: &[TeamEntry],
        assignments: &[TransponderAssignment],
    ) -> Result<(), LifecycleError> {
        // Validate everything before touching state
        {
            let race = self.race_ref(race_id)?;
            if race.ended.is_some() {
                return Err(LifecycleError::AlreadyEnded(race_id));
            }
        }

        for team in teams.iter().filter(|t| !t.retired) {
            let assigned = assignments.iter().any(|a| {
                a.race_id == race_id && a.team_id == team.team_id && !a.transponder_ids.is_empty()
            });
            if !assigned {
                return Err(LifecycleError::PrecheckFailed {
                    race_id,
                    reason: format!("team {} has no transponder assignment", team.number),
                });
            }

            match team.driver_weight_kg {
                Some(w) if (MIN_DRIVER_WEIGHT_KG..=MAX_DRIVER_WEIGHT_KG).contains(&w) => {}
                Some(w) => {
                    return Err(LifecycleError::PrecheckFailed {
                        race_id,
                        reason: format!("team {} driver weight {w:.1}kg implausible", team.number),
                    })
                }
                None => {
                    return Err(LifecycleError::PrecheckFailed {
                        race_id,
                        reason: format!("team {} has no registered driver", team.number),
                    })
                }
            }
        }

        let race = self.race_mut(race_id)?;
        race.ready = true;
        info!(race_id, "race pre-check passed");
        Ok(())
    }

    /// Start a race. With `StartMode::FirstCrossing` the race is armed and the
    /// clock is set by the first crossing instead.
    #[instrument(name = "lifecycle_start", skip(self), fields(race_id))]
    pub fn start_race(&mut self, race_id: RaceId, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if let Some(active) = self.active_race() {
            if active.id != race_id {
                return Err(LifecycleError::AnotherRaceActive(active.id));
            }
        }
        {
            let race = self.race_ref(race_id)?;
            if !race.ready {
                return Err(LifecycleError::NotReady(race_id));
            }
            if race.started.is_some() {
                return Err(LifecycleError::AlreadyStarted(race_id));
            }
            if race.ended.is_some() {
                return Err(LifecycleError::AlreadyEnded(race_id));
            }
        }

        let start_mode = self.race_ref(race_id)?.start_mode;
        if start_mode == StartMode::Immediate {
            let race = self.race_mut(race_id)?;
            race.started = Some(now);
        }
        // Round clock starts with its first race either way
        if self.round.started.is_none() {
            self.round.started = Some(now);
        }
        info!(race_id, ?start_mode, "race started");
        metrics::counter!("lifecycle_race_starts_total").increment(1);
        Ok(())
    }

    /// Set an armed race's clock from its first lap crossing.
    pub fn record_first_crossing_start(
        &mut self,
        race_id: RaceId,
        at: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        {
            let race = self.race_ref(race_id)?;
            if race.start_mode != StartMode::FirstCrossing || race.started.is_some() {
                return Err(LifecycleError::AlreadyStarted(race_id));
            }
        }
        let race = self.race_mut(race_id)?;
        race.started = Some(at);
        info!(race_id, "race clock set by first crossing");
        Ok(())
    }

    /// Pause the round clock (affects every race in the round).
    #[instrument(name = "lifecycle_pause", skip(self))]
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.round.started.is_none() || self.round.ended.is_some() {
            return Err(LifecycleError::RoundNotRunning);
        }
        if self.is_paused() {
            return Err(LifecycleError::AlreadyPaused);
        }
        if let Some(last) = self.round.pauses.last() {
            // Closed windows must stay ordered and disjoint
            if last.end.map(|end| now < end).unwrap_or(false) {
                return Err(TimingError::invariant(format!(
                    "pause at {now} would overlap window ending {:?}",
                    last.end
                ))
                .into());
            }
        }
        self.round.pauses.push(PauseWindow {
            start: now,
            end: None,
        });
        info!("round paused");
        Ok(())
    }

    /// Close the open pause window.
    #[instrument(name = "lifecycle_resume", skip(self))]
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        let open = self
            .round
            .pauses
            .iter_mut()
            .find(|p| p.end.is_none())
            .ok_or(LifecycleError::NotPaused)?;
        open.end = Some(now);
        info!("round resumed");
        Ok(())
    }

    /// Undo a start within the grace period: the race (and, if no other race
    /// ever started, the round) returns to the unstarted state.
    #[instrument(name = "lifecycle_false_start", skip(self), fields(race_id))]
    pub fn false_start(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let grace = self.config.false_start_grace;
        {
            let race = self.race_ref(race_id)?;
            let started = race.started.ok_or(LifecycleError::NotStarted(race_id))?;
            if race.ended.is_some() {
                return Err(LifecycleError::AlreadyEnded(race_id));
            }
            let elapsed = (now - started).as_seconds_f64();
            if elapsed > grace {
                return Err(LifecycleError::GraceExpired { elapsed, grace });
            }
        }

        self.race_mut(race_id)?.started = None;
        let any_other_started = self
            .races
            .iter()
            .any(|r| r.id != race_id && r.started.is_some());
        if !any_other_started {
            self.round.started = None;
        }
        warn!(race_id, "false start - race start reverted");
        metrics::counter!("lifecycle_false_starts_total").increment(1);
        Ok(())
    }

    /// Undo a resume within the grace period by reopening the most recently
    /// closed pause window.
    #[instrument(name = "lifecycle_false_restart", skip(self))]
    pub fn false_restart(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.is_paused() {
            return Err(LifecycleError::AlreadyPaused);
        }
        let grace = self.config.false_restart_grace;
        let last_closed = self
            .round
            .pauses
            .iter_mut()
            .filter(|p| p.end.is_some())
            .last()
            .ok_or(LifecycleError::NoPauseToReopen)?;

        let resumed_at = last_closed.end.expect("filtered on end.is_some");
        let elapsed = (now - resumed_at).as_seconds_f64();
        if elapsed > grace {
            return Err(LifecycleError::GraceExpired { elapsed, grace });
        }

        last_closed.end = None;
        warn!("false restart - pause window reopened");
        Ok(())
    }

    /// End a race. Promotes the next race in sequence (pre-check pending), or
    /// ends the round when this was the last one.
    ///
    /// Returns the id of the promoted race, if any.
    #[instrument(name = "lifecycle_end", skip(self), fields(race_id))]
    pub fn end_race(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
    ) -> Result<Option<RaceId>, LifecycleError> {
        {
            let race = self.race_ref(race_id)?;
            if race.started.is_none() {
                return Err(LifecycleError::NotStarted(race_id));
            }
            if race.ended.is_some() {
                return Err(LifecycleError::AlreadyEnded(race_id));
            }
        }
        self.race_mut(race_id)?.ended = Some(now);
        metrics::counter!("lifecycle_race_ends_total").increment(1);

        let sequence = self.race_ref(race_id)?.sequence_number;
        let next = self
            .races
            .iter()
            .filter(|r| r.sequence_number > sequence && r.ended.is_none())
            .min_by_key(|r| r.sequence_number)
            .map(|r| r.id);

        match next {
            Some(next_id) => {
                info!(race_id, next_id, "race ended, next race pending pre-check");
                Ok(Some(next_id))
            }
            None => {
                self.round.ended = Some(now);
                info!(race_id, "race ended, round complete");
                Ok(None)
            }
        }
    }

    fn race_ref(&self, race_id: RaceId) -> Result<&Race, LifecycleError> {
        self.race(race_id).ok_or(LifecycleError::UnknownRace(race_id))
    }

    fn race_mut(&mut self, race_id: RaceId) -> Result<&mut Race, LifecycleError> {
        self.races
            .iter_mut()
            .find(|r| r.id == race_id)
            .ok_or(LifecycleError::UnknownRace(race_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use contracts::EndingMode;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn race(id: RaceId, sequence: u32) -> Race {
        Race {
            id,
            round_id: 1,
            sequence_number: sequence,
            ending_mode: EndingMode::FullLaps,
            start_mode: StartMode::Immediate,
            time_limit_override: None,
            lap_count_override: None,
            count_crossings_during_suspension: false,
            ready: false,
            started: None,
            ended: None,
            depends_on_race: if sequence > 1 { Some(id - 1) } else { None },
        }
    }

    fn round() -> Round {
        Round {
            id: 1,
            started: None,
            ended: None,
            pauses: vec![],
            time_limit_adjustment: None,
            lap_count_adjustment: None,
        }
    }

    fn team(team_id: u64, number: u32) -> TeamEntry {
        TeamEntry {
            team_id,
            number,
            driver_weight_kg: Some(72.5),
            retired: false,
        }
    }

    fn assignment(race_id: RaceId, team_id: u64) -> TransponderAssignment {
        TransponderAssignment {
            race_id,
            team_id,
            kart_number: team_id as u32,
            transponder_ids: vec![format!("{:06}", 100000 + team_id).into()],
        }
    }

    fn ready_state() -> RoundState {
        let mut state = RoundState::new(round(), vec![race(1, 1), race(2, 2)]);
        let teams = [team(1, 11), team(2, 22)];
        let assignments = [assignment(1, 1), assignment(1, 2)];
        state.run_precheck(1, &teams, &assignments).unwrap();
        state
    }

    #[test]
    fn test_precheck_requires_assignments() {
        let mut state = RoundState::new(round(), vec![race(1, 1)]);
        let teams = [team(1, 11), team(2, 22)];
        // Team 2 has no assignment
        let assignments = [assignment(1, 1)];

        let err = state.run_precheck(1, &teams, &assignments).unwrap_err();
        assert!(matches!(err, LifecycleError::PrecheckFailed { .. }));
        assert!(!state.race(1).unwrap().ready);
    }

    #[test]
    fn test_precheck_rejects_implausible_weight() {
        let mut state = RoundState::new(round(), vec![race(1, 1)]);
        let mut heavy = team(1, 11);
        heavy.driver_weight_kg = Some(431.0);
        let err = state
            .run_precheck(1, &[heavy], &[assignment(1, 1)])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::PrecheckFailed { .. }));
    }

    #[test]
    fn test_precheck_skips_retired_teams() {
        let mut state = RoundState::new(round(), vec![race(1, 1)]);
        let mut retired = team(2, 22);
        retired.retired = true;
        state
            .run_precheck(1, &[team(1, 11), retired], &[assignment(1, 1)])
            .unwrap();
        assert!(state.race(1).unwrap().ready);
    }

    #[test]
    fn test_start_sets_round_clock_on_first_race() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();

        assert_eq!(state.race(1).unwrap().started, Some(at(0)));
        assert_eq!(state.round().started, Some(at(0)));
        assert_eq!(state.active_race().unwrap().id, 1);
    }

    #[test]
    fn test_start_twice_is_rejected_and_state_unchanged() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();
        let err = state.start_race(1, at(5)).unwrap_err();
        assert_eq!(err, LifecycleError::AlreadyStarted(1));
        assert_eq!(state.race(1).unwrap().started, Some(at(0)));
    }

    #[test]
    fn test_start_unready_race_rejected() {
        let mut state = RoundState::new(round(), vec![race(1, 1)]);
        let err = state.start_race(1, at(0)).unwrap_err();
        assert_eq!(err, LifecycleError::NotReady(1));
    }

    #[test]
    fn test_false_start_within_grace_resets_everything() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();
        state.false_start(1, at(10)).unwrap();

        assert_eq!(state.race(1).unwrap().started, None);
        assert_eq!(state.round().started, None);
        assert!(state.active_race().is_none());
    }

    #[test]
    fn test_false_start_after_grace_rejected() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();
        let err = state.false_start(1, at(20)).unwrap_err();
        assert!(matches!(err, LifecycleError::GraceExpired { .. }));
        assert_eq!(state.race(1).unwrap().started, Some(at(0)));
        assert_eq!(state.round().started, Some(at(0)));
    }

    #[test]
    fn test_false_start_keeps_round_clock_when_other_race_started() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();
        state.end_race(1, at(100)).unwrap();

        let teams = [team(1, 11), team(2, 22)];
        let assignments = [assignment(2, 1), assignment(2, 2)];
        state.run_precheck(2, &teams, &assignments).unwrap();
        state.start_race(2, at(200)).unwrap();
        state.false_start(2, at(205)).unwrap();

        // Race 1 already ran; the round clock survives
        assert_eq!(state.race(2).unwrap().started, None);
        assert_eq!(state.round().started, Some(at(0)));
    }

    #[test]
    fn test_pause_resume_and_false_restart() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();

        state.pause(at(30)).unwrap();
        assert!(state.is_paused());
        assert_eq!(state.pause(at(31)).unwrap_err(), LifecycleError::AlreadyPaused);

        state.resume(at(60)).unwrap();
        assert!(!state.is_paused());

        // Reopen within grace
        state.false_restart(at(70)).unwrap();
        assert!(state.is_paused());
        assert_eq!(state.round().pauses.len(), 1);
        assert_eq!(state.round().pauses[0].end, None);
    }

    #[test]
    fn test_false_restart_after_grace_rejected() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();
        state.pause(at(30)).unwrap();
        state.resume(at(60)).unwrap();

        let err = state.false_restart(at(90)).unwrap_err();
        assert!(matches!(err, LifecycleError::GraceExpired { .. }));
        assert!(!state.is_paused());
    }

    #[test]
    fn test_end_race_promotes_next_then_ends_round() {
        let mut state = ready_state();
        state.start_race(1, at(0)).unwrap();

        let next = state.end_race(1, at(100)).unwrap();
        assert_eq!(next, Some(2));
        assert!(state.round().ended.is_none());
        // Promoted race awaits its own pre-check
        assert!(!state.race(2).unwrap().ready);

        let teams = [team(1, 11)];
        let assignments = [assignment(2, 1)];
        state.run_precheck(2, &teams, &assignments).unwrap();
        state.start_race(2, at(120)).unwrap();
        let next = state.end_race(2, at(300)).unwrap();
        assert_eq!(next, None);
        assert_eq!(state.round().ended, Some(at(300)));
    }

    #[test]
    fn test_only_one_active_race() {
        let mut state = ready_state();
        let teams = [team(1, 11)];
        let assignments = [assignment(2, 1)];
        state.run_precheck(2, &teams, &assignments).unwrap();

        state.start_race(1, at(0)).unwrap();
        let err = state.start_race(2, at(5)).unwrap_err();
        assert_eq!(err, LifecycleError::AnotherRaceActive(1));
    }

    #[test]
    fn test_first_crossing_start_mode() {
        let mut state = RoundState::new(round(), {
            let mut r = race(1, 1);
            r.start_mode = StartMode::FirstCrossing;
            vec![r]
        });
        state
            .run_precheck(1, &[team(1, 11)], &[assignment(1, 1)])
            .unwrap();

        state.start_race(1, at(0)).unwrap();
        // Armed: round clock runs, race clock waits for the first crossing
        assert_eq!(state.race(1).unwrap().started, None);
        assert_eq!(state.round().started, Some(at(0)));

        state.record_first_crossing_start(1, at(12)).unwrap();
        assert_eq!(state.race(1).unwrap().started, Some(at(12)));
    }
}
