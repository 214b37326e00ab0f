//! Timing pipeline metric helpers
//!
//! Thin wrappers over the `metrics` macros so every binary names things the
//! same way on the Prometheus side.

use metrics::{counter, gauge, histogram};

/// Record one crossing observed at a pipeline stage.
pub fn record_crossing(stage: &str, transponder_id: &str) {
    counter!(
        "trackside_crossings_total",
        "stage" => stage.to_string(),
        "transponder_id" => transponder_id.to_string()
    )
    .increment(1);
}

/// Record a lap accepted by the ingestion engine.
pub fn record_lap(race_id: u64, suspicious: bool) {
    let flag = if suspicious { "suspicious" } else { "clean" };
    counter!(
        "trackside_laps_total",
        "race_id" => race_id.to_string(),
        "kind" => flag.to_string()
    )
    .increment(1);
}

/// Record a dropped message and why (dedup, auth, malformed, no_race).
pub fn record_drop(reason: &str) {
    counter!("trackside_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Current relay queue backlog for one queue.
pub fn record_queue_depth(queue: &str, pending: u64) {
    gauge!("trackside_queue_pending", "queue" => queue.to_string()).set(pending as f64);
}

/// End-to-end lag from crossing timestamp to server processing, milliseconds.
pub fn record_pipeline_lag(lag_ms: f64) {
    histogram!("trackside_pipeline_lag_ms").record(lag_ms);
}

/// Uplink connection state changes.
pub fn record_link_state(component: &str, state: &str) {
    counter!(
        "trackside_link_transitions_total",
        "component" => component.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Aggregates pipeline lag in memory for end-of-run summaries.
#[derive(Debug, Clone, Default)]
pub struct LagStats {
    count: u64,
    sum_ms: f64,
    max_ms: f64,
}

impl LagStats {
    pub fn update(&mut self, lag_ms: f64) {
        self.count += 1;
        self.sum_ms += lag_ms;
        if lag_ms > self.max_ms {
            self.max_ms = lag_ms;
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ms
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
