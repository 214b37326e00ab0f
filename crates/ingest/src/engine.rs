//! The ingestion engine - one crossing in, validated lap data out.
//!
//! Single-writer: all crossings flow through one engine instance on one task,
//! which keeps lap_number monotonic per (race, team) without per-team locks.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use contracts::{
    ChampionshipDefaults, CrossingEvent, LapCrossing, LapStore, RaceEvent, RaceId, TeamEntry,
    TeamId, TransponderAssignment, TransponderId,
};
use race_core::{
    crossing_disposition, evaluate, resolve_params, CrossingDisposition, EndingParams, EvalInput,
    FinishDecision, LifecycleError, RoundState, TeamProgress,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::leaderboard::compute_standings;

/// Stateful crossing processor for one round.
///
/// Owns the lifecycle state, the team/assignment registry and the lap store.
/// No I/O: the server task feeds it verified events and broadcasts whatever
/// it returns.
pub struct IngestionEngine<S: LapStore> {
    config: IngestConfig,
    championship: ChampionshipDefaults,
    state: RoundState,
    teams: Vec<TeamEntry>,
    assignments: HashMap<RaceId, Vec<TransponderAssignment>>,
    store: S,
    finished_teams: HashMap<RaceId, HashSet<TeamId>>,
    /// Wall-clock standings freeze point for TIME_ONLY races
    standings_cutoff: HashMap<RaceId, DateTime<Utc>>,
}

impl<S: LapStore> IngestionEngine<S> {
    pub fn new(
        config: IngestConfig,
        championship: ChampionshipDefaults,
        state: RoundState,
        teams: Vec<TeamEntry>,
        assignments: Vec<TransponderAssignment>,
        store: S,
    ) -> Self {
        let mut by_race: HashMap<RaceId, Vec<TransponderAssignment>> = HashMap::new();
        for assignment in assignments {
            by_race.entry(assignment.race_id).or_default().push(assignment);
        }
        Self {
            config,
            championship,
            state,
            teams,
            assignments: by_race,
            store,
            finished_teams: HashMap::new(),
            standings_cutoff: HashMap::new(),
        }
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one authenticated crossing.
    #[instrument(name = "engine_handle_crossing", skip(self, event), fields(transponder_id = %event.transponder_id))]
    pub fn handle_crossing(&mut self, event: &CrossingEvent) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        let ts = event.timestamp;
        metrics::counter!("ingest_crossings_total").increment(1);

        let Some(race_id) = self.target_race_id() else {
            debug!("crossing with no active race, dropped");
            metrics::counter!("ingest_crossings_dropped_total", "reason" => "no_race").increment(1);
            return events;
        };

        self.ensure_assignments(race_id);
        let Some((team_id, team_number)) = self.resolve_team(race_id, &event.transponder_id)
        else {
            warn!(transponder_id = %event.transponder_id, "unknown transponder");
            metrics::counter!("ingest_unknown_transponder_total").increment(1);
            events.push(RaceEvent::Warning {
                message: format!(
                    "crossing from unknown transponder {}",
                    event.transponder_id
                ),
            });
            return events;
        };

        // Redundant-transponder dedup: any crossing for this team within the
        // window of an already-recorded one is the same physical pass. The
        // window is anchored at the recorded crossing, not sliding.
        let crossings = self.store.team_crossings(race_id, team_id);
        let window = self.config.dedup_window_secs;
        let duplicate = crossings.iter().any(|c| {
            let delta = (ts - c.timestamp).as_seconds_f64();
            (0.0..window).contains(&delta)
        });
        if duplicate {
            debug!(team_id, "dedup window hit, crossing dropped");
            metrics::counter!("ingest_crossings_dropped_total", "reason" => "dedup").increment(1);
            return events;
        }

        // An armed race starts its clock on the first crossing
        if self
            .state
            .race(race_id)
            .map(|r| r.started.is_none())
            .unwrap_or(false)
        {
            if let Err(e) = self.state.record_first_crossing_start(race_id, ts) {
                warn!(error = %e, "could not start armed race from crossing");
            }
        }

        let (params, disposition, suspended_invalid) = {
            let race = match self.state.race(race_id) {
                Some(r) => r,
                None => return events,
            };
            let round = self.state.round();
            let params = resolve_params(race, round, &self.championship);
            let prev_valid_ts = crossings
                .iter()
                .filter(|c| c.is_valid)
                .last()
                .map(|c| c.timestamp);
            let lap_started_at = prev_valid_ts.or(race.started);
            let disposition = crossing_disposition(race, round, params, lap_started_at, ts);
            let suspended_invalid =
                self.state.is_paused() && !race.count_crossings_during_suspension;
            (params, disposition, suspended_invalid)
        };

        let team_finished = self
            .finished_teams
            .get(&race_id)
            .map(|set| set.contains(&team_id))
            .unwrap_or(false);

        let is_valid =
            disposition == CrossingDisposition::Count && !suspended_invalid && !team_finished;

        let valid_prior: Vec<&LapCrossing> = crossings.iter().filter(|c| c.is_valid).collect();
        let lap_number = valid_prior.len() as u32 + 1;
        let lap_time = self.compute_lap_time(race_id, &valid_prior, ts);
        let is_suspicious = is_valid
            && lap_time
                .map(|lt| self.is_lap_suspicious(&valid_prior, lt))
                .unwrap_or(false);

        let record = LapCrossing {
            id: 0,
            race_id,
            team_id,
            transponder_id: event.transponder_id.clone(),
            timestamp: ts,
            raw_time: event.raw_time,
            lap_number,
            lap_time,
            is_suspicious,
            is_valid,
            was_split: false,
        };
        let stored = match self.store.insert(record) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to persist crossing");
                events.push(RaceEvent::Warning {
                    message: format!("failed to persist crossing: {e}"),
                });
                return events;
            }
        };

        info!(
            team_number,
            lap_number,
            lap_time = ?lap_time,
            is_valid,
            is_suspicious,
            "lap recorded"
        );
        metrics::counter!("ingest_laps_recorded_total").increment(1);
        events.push(RaceEvent::RaceLapUpdate {
            race_id,
            team_number,
            lap_number,
            lap_time,
            is_suspicious,
            crossing_id: stored.id,
        });
        if is_suspicious {
            events.push(RaceEvent::Warning {
                message: format!(
                    "suspicious lap: team {team_number} lap {lap_number} took {:.3}s",
                    lap_time.unwrap_or_default()
                ),
            });
        }

        events.extend(self.evaluate_finish(race_id, params, ts));
        events
    }

    /// Re-evaluate time-based finish conditions without a crossing.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<RaceEvent> {
        let Some(race) = self.state.active_race() else {
            return Vec::new();
        };
        let race_id = race.id;
        let params = resolve_params(race, self.state.round(), &self.championship);
        self.evaluate_finish(race_id, params, now)
    }

    /// Manual correction: one recorded crossing actually covered two laps.
    pub fn split_crossing(
        &mut self,
        crossing_id: u64,
        first_lap_time: f64,
    ) -> Result<(LapCrossing, LapCrossing), contracts::TimingError> {
        let result = self.store.split(crossing_id, first_lap_time)?;
        info!(crossing_id, "crossing split applied");
        Ok(result)
    }

    /// Current standings for a race (frozen at the cutoff for TIME_ONLY).
    pub fn standings(&self, race_id: RaceId) -> Vec<contracts::StandingEntry> {
        compute_standings(
            &self.store,
            race_id,
            &self.teams,
            self.standings_cutoff.get(&race_id).copied(),
        )
    }

    // ===== race control passthroughs =====

    pub fn start_race(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.state.start_race(race_id, now)
    }

    pub fn run_precheck(&mut self, race_id: RaceId) -> Result<(), LifecycleError> {
        self.ensure_assignments(race_id);
        let assignments = self
            .assignments
            .get(&race_id)
            .cloned()
            .unwrap_or_default();
        self.state.run_precheck(race_id, &self.teams, &assignments)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.state.pause(now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.state.resume(now)
    }

    pub fn false_start(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.state.false_start(race_id, now)
    }

    pub fn false_restart(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.state.false_restart(now)
    }

    /// Manual End Race - always available, short-circuits evaluation.
    pub fn end_race(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RaceEvent>, LifecycleError> {
        self.state.end_race(race_id, now)?;
        Ok(vec![RaceEvent::RaceFinished {
            race_id,
            team_id: None,
        }])
    }

    /// Replace the assignments of one race (race-control command).
    pub fn update_assignments(&mut self, race_id: RaceId, entries: Vec<TransponderAssignment>) {
        info!(race_id, count = entries.len(), "assignments updated");
        self.assignments.insert(race_id, entries);
    }

    // ===== internals =====

    /// The race crossings belong to right now: the active race, or an armed
    /// FirstCrossing race waiting for its first pass.
    fn target_race_id(&self) -> Option<RaceId> {
        if let Some(active) = self.state.active_race() {
            return Some(active.id);
        }
        if self.state.round().started.is_some() {
            if let Some(upcoming) = self.state.upcoming_race() {
                if upcoming.ready
                    && upcoming.start_mode == contracts::StartMode::FirstCrossing
                {
                    return Some(upcoming.id);
                }
            }
        }
        None
    }

    /// Clone assignments from `depends_on_race` when a race has none yet.
    fn ensure_assignments(&mut self, race_id: RaceId) {
        let has_own = self
            .assignments
            .get(&race_id)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if has_own {
            return;
        }
        let Some(dep_id) = self.state.race(race_id).and_then(|r| r.depends_on_race) else {
            return;
        };
        let Some(parent) = self.assignments.get(&dep_id) else {
            return;
        };
        let cloned: Vec<TransponderAssignment> = parent
            .iter()
            .map(|a| TransponderAssignment {
                race_id,
                ..a.clone()
            })
            .collect();
        if !cloned.is_empty() {
            info!(race_id, from = dep_id, count = cloned.len(), "assignments inherited");
            self.assignments.insert(race_id, cloned);
        }
    }

    fn resolve_team(&self, race_id: RaceId, transponder_id: &TransponderId) -> Option<(TeamId, u32)> {
        let assignment = self
            .assignments
            .get(&race_id)?
            .iter()
            .find(|a| a.transponder_ids.contains(transponder_id))?;
        let number = self
            .teams
            .iter()
            .find(|t| t.team_id == assignment.team_id)
            .map(|t| t.number)
            .unwrap_or(assignment.kart_number);
        Some((assignment.team_id, number))
    }

    fn compute_lap_time(
        &self,
        race_id: RaceId,
        valid_prior: &[&LapCrossing],
        ts: DateTime<Utc>,
    ) -> Option<f64> {
        let reference = valid_prior
            .last()
            .map(|c| c.timestamp)
            .or_else(|| self.state.race(race_id).and_then(|r| r.started));
        let lap_time = (ts - reference?).as_seconds_f64();
        (lap_time > 0.0).then_some(lap_time)
    }

    /// Lap is suspicious when it exceeds multiplier x median of the team's
    /// valid laps (including this one), given enough samples.
    fn is_lap_suspicious(&self, valid_prior: &[&LapCrossing], lap_time: f64) -> bool {
        let mut samples: Vec<f64> = valid_prior.iter().filter_map(|c| c.lap_time).collect();
        samples.push(lap_time);
        if samples.len() < self.config.suspicious_min_samples {
            return false;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = samples[samples.len() / 2];
        lap_time > median * self.config.suspicious_multiplier
    }

    fn team_progress(&self, race_id: RaceId, params: EndingParams) -> Vec<TeamProgress> {
        let Some(assignments) = self.assignments.get(&race_id) else {
            return Vec::new();
        };
        assignments
            .iter()
            .filter(|a| {
                self.teams
                    .iter()
                    .find(|t| t.team_id == a.team_id)
                    .map(|t| !t.retired)
                    .unwrap_or(true)
            })
            .map(|a| {
                let valid: Vec<LapCrossing> = self
                    .store
                    .team_crossings(race_id, a.team_id)
                    .into_iter()
                    .filter(|c| c.is_valid)
                    .collect();
                let laps_completed = valid.len() as u32;
                let reached_lap_count_at = (params.lap_count > 0
                    && laps_completed >= params.lap_count)
                    .then(|| valid[params.lap_count as usize - 1].timestamp);
                TeamProgress {
                    team_id: a.team_id,
                    laps_completed,
                    last_crossing: valid.last().map(|c| c.timestamp),
                    reached_lap_count_at,
                }
            })
            .collect()
    }

    fn evaluate_finish(
        &mut self,
        race_id: RaceId,
        params: EndingParams,
        now: DateTime<Utc>,
    ) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        let progress = self.team_progress(race_id, params);
        let decision = {
            let Some(race) = self.state.race(race_id) else {
                return events;
            };
            evaluate(EvalInput {
                race,
                round: self.state.round(),
                params,
                teams: &progress,
                now,
            })
        };

        match decision {
            FinishDecision::Pending => {}
            FinishDecision::TeamsFinished(team_ids) => {
                let finished = self.finished_teams.entry(race_id).or_default();
                let mut newly_finished = Vec::new();
                for team_id in team_ids {
                    if finished.insert(team_id) {
                        newly_finished.push(team_id);
                    }
                }
                for team_id in newly_finished {
                    info!(race_id, team_id, "team finished");
                    events.push(RaceEvent::RaceFinished {
                        race_id,
                        team_id: Some(team_id),
                    });
                }
                // Once every competing team is home, the race is over
                if self
                    .finished_teams
                    .get(&race_id)
                    .map(|set| set.len() >= progress.len() && !progress.is_empty())
                    .unwrap_or(false)
                {
                    events.extend(self.finish_race(race_id, now, None));
                }
            }
            FinishDecision::RaceFinished { cutoff } => {
                events.extend(self.finish_race(race_id, now, cutoff));
            }
        }
        events
    }

    fn finish_race(
        &mut self,
        race_id: RaceId,
        now: DateTime<Utc>,
        cutoff: Option<DateTime<Utc>>,
    ) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        if let Some(cutoff) = cutoff {
            self.standings_cutoff.insert(race_id, cutoff);
        }
        match self.state.end_race(race_id, now) {
            Ok(next) => {
                info!(race_id, ?next, "race auto-finished");
                metrics::counter!("ingest_races_finished_total").increment(1);
                events.push(RaceEvent::RaceFinished {
                    race_id,
                    team_id: None,
                });
            }
            Err(e) => warn!(race_id, error = %e, "auto-finish rejected"),
        }
        events
    }
}
