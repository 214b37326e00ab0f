//! Ingestion tuning knobs.
//!
//! The dedup window and suspicious multiplier are configuration inputs with
//! the observed defaults, not hard-coded constants.

use serde::{Deserialize, Serialize};

/// Ingestion configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Seconds after a team's recorded crossing during which further
    /// crossings from its (redundant) transponders are the same physical pass
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: f64,

    /// A lap is suspicious when lap_time > multiplier x median
    #[serde(default = "default_suspicious_multiplier")]
    pub suspicious_multiplier: f64,

    /// Valid lap samples needed before the median is meaningful
    #[serde(default = "default_suspicious_min_samples")]
    pub suspicious_min_samples: usize,

    /// Minimum seconds between standings recomputations
    #[serde(default = "default_leaderboard_debounce")]
    pub leaderboard_debounce_secs: f64,
}

fn default_dedup_window() -> f64 {
    7.0
}

fn default_suspicious_multiplier() -> f64 {
    2.0
}

fn default_suspicious_min_samples() -> usize {
    3
}

fn default_leaderboard_debounce() -> f64 {
    1.0
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window(),
            suspicious_multiplier: default_suspicious_multiplier(),
            suspicious_min_samples: default_suspicious_min_samples(),
            leaderboard_debounce_secs: default_leaderboard_debounce(),
        }
    }
}
