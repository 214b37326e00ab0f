//! # Race Core
//!
//! Race and round lifecycle: the state machine driving
//! `Initial -> Ready -> Running <-> Paused -> Ended`, round-scoped pause
//! accounting, false-start / false-restart grace handling, multi-race
//! sequencing, and the ending-mode evaluator that decides when a race is
//! over and what "finished" means for each team.
//!
//! All state lives in explicit owned values ([`RoundState`]); nothing here
//! performs I/O.

mod ending;
mod lifecycle;
mod timed;

pub use ending::{
    crossing_disposition, evaluate, expiry_instant, resolve_params, CrossingDisposition,
    EndingParams, EvalInput, FinishDecision, TeamProgress, FALLBACK_LAP_COUNT,
    FALLBACK_TIME_LIMIT,
};
pub use lifecycle::{LifecycleConfig, LifecycleError, RoundState};
pub use timed::{paused_overlap, RaceTimer, TimedEntity};
