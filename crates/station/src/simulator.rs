//! Simulator source - synthetic transponder crossings for testing.
//!
//! Simulates a rolling start and then continuous realistic laps: each
//! transponder gets a base lap time drawn from the configured range, every
//! lap adds uniform variance, and the whole simulation can run faster than
//! real time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::Sender;
use chrono::Utc;
use contracts::{
    CrossingEvent, SimulatorSettings, SourceType, TimingError, TimingMode, TransponderId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::source::{send_event, SourceStatus, StopFlag};

/// Synthetic crossing generator.
pub struct SimulatorSource {
    settings: SimulatorSettings,
    timing_mode: TimingMode,
    rollover_seconds: f64,
    transponder_ids: Vec<TransponderId>,
    connected: bool,
    reading: StopFlag,
    crossings_emitted: Arc<AtomicU64>,
}

impl SimulatorSource {
    pub fn new(settings: SimulatorSettings, timing_mode: TimingMode, rollover_seconds: f64) -> Self {
        Self {
            settings,
            timing_mode,
            rollover_seconds,
            transponder_ids: Vec::new(),
            connected: false,
            reading: Arc::new(AtomicBool::new(false)),
            crossings_emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn connect(&mut self) -> Result<(), TimingError> {
        self.transponder_ids = if self.settings.transponder_ids.is_empty() {
            (0..self.settings.num_transponders)
                .map(|i| TransponderId::from(format!("{:06}", 100_000 + i + 1)))
                .collect()
        } else {
            self.settings
                .transponder_ids
                .iter()
                .map(|s| TransponderId::new(s))
                .collect()
        };
        self.connected = true;
        info!(
            transponders = self.transponder_ids.len(),
            timing_mode = ?self.timing_mode,
            "simulator connected"
        );
        Ok(())
    }

    pub fn start(&self, tx: Sender<CrossingEvent>) {
        if self.reading.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = self.transponder_ids.clone();
        let settings = self.settings.clone();
        let timing_mode = self.timing_mode;
        let rollover = self.rollover_seconds;
        let reading = self.reading.clone();
        let emitted = self.crossings_emitted.clone();

        tokio::spawn(async move {
            run_simulation(ids, settings, timing_mode, rollover, reading, emitted, tx).await;
        });
    }

    pub fn stop(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            source_type: SourceType::Simulator,
            connected: self.connected,
            reading: self.is_reading(),
            detail: json!({
                "num_transponders": self.transponder_ids.len(),
                "timing_mode": self.timing_mode,
                "sim_speed": self.settings.sim_speed,
                "crossings_emitted": self.crossings_emitted.load(Ordering::Relaxed),
            }),
        }
    }
}

/// Per-transponder simulation state.
struct KartState {
    id: TransponderId,
    /// Simulated race clock of the last (or pending first) crossing
    cumulative: f64,
    base_lap_time: f64,
}

async fn run_simulation(
    ids: Vec<TransponderId>,
    settings: SimulatorSettings,
    timing_mode: TimingMode,
    rollover: f64,
    reading: StopFlag,
    emitted: Arc<AtomicU64>,
    tx: Sender<CrossingEvent>,
) {
    // Thread-local rngs cannot cross the awaits below; seed an owned one
    let mut rng = StdRng::from_os_rng();
    let sim_speed = settings.sim_speed.max(0.01);

    // Rolling start: karts reach the loop at different offsets
    let mut start_offsets: Vec<f64> = ids.iter().map(|_| rng.random_range(0.0..10.0)).collect();
    start_offsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut karts: Vec<KartState> = ids
        .into_iter()
        .zip(start_offsets)
        .map(|(id, offset)| KartState {
            id,
            cumulative: offset,
            base_lap_time: rng.random_range(settings.lap_time_min..=settings.lap_time_max),
        })
        .collect();

    // Seconds-since-midnight at simulation start, for time_of_day decoders
    let tod_offset = {
        let now = Utc::now();
        use chrono::Timelike;
        f64::from(now.hour() * 3600 + now.minute() * 60 + now.second())
    };

    let mut race_clock = 0.0f64;
    let mut sequence = 0u64;

    debug!(karts = karts.len(), sim_speed, "simulation loop started");

    while reading.load(Ordering::Relaxed) {
        // Next crossing over all karts
        let Some((idx, next_time, lap_time)) = karts
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let variance =
                    rng.random_range(-settings.lap_time_variance..=settings.lap_time_variance);
                let lap = (k.base_lap_time + variance).max(1.0);
                (i, k.cumulative + lap, lap)
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            break;
        };

        let wait = (next_time - race_clock).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(wait / sim_speed)).await;
        if !reading.load(Ordering::Relaxed) {
            break;
        }

        race_clock = next_time;
        karts[idx].cumulative = next_time;

        let raw_time = match timing_mode {
            TimingMode::Interval => lap_time,
            TimingMode::Duration => next_time,
            TimingMode::TimeOfDay => (tod_offset + next_time) % 86_400.0,
            TimingMode::OwnTime => next_time % rollover,
        };

        sequence += 1;
        let event = CrossingEvent {
            transponder_id: karts[idx].id.clone(),
            timestamp: Utc::now(),
            raw_time,
            signal_strength: rng.random_range(80..=100),
            source_sequence: Some(sequence),
        };
        emitted.fetch_add(1, Ordering::Relaxed);
        send_event(&tx, event, "simulator");
    }

    debug!("simulation loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> SimulatorSettings {
        SimulatorSettings {
            num_transponders: 3,
            lap_time_min: 1.0,
            lap_time_max: 2.0,
            lap_time_variance: 0.2,
            transponder_ids: Vec::new(),
            sim_speed: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_simulator_emits_crossings() {
        let mut source =
            SimulatorSource::new(fast_settings(), TimingMode::Duration, 360_000.0);
        source.connect().await.unwrap();

        let (tx, rx) = async_channel::bounded(64);
        source.start(tx);

        let mut received = Vec::new();
        for _ in 0..6 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("simulator should produce crossings")
                .unwrap();
            received.push(event);
        }
        source.stop();

        // Every crossing carries a known transponder and increasing sequence
        for event in &received {
            assert!(event.transponder_id.starts_with("1000"));
        }
        let seqs: Vec<u64> = received.iter().filter_map(|e| e.source_sequence).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_fixed_transponder_ids() {
        let mut settings = fast_settings();
        settings.transponder_ids = vec!["777001".to_string(), "777002".to_string()];
        let mut source = SimulatorSource::new(settings, TimingMode::Duration, 360_000.0);
        source.connect().await.unwrap();

        let (tx, rx) = async_channel::bounded(16);
        source.start(tx);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        source.stop();
        assert!(event.transponder_id.starts_with("777"));
    }

    #[tokio::test]
    async fn test_interval_mode_raw_time_is_lap_duration() {
        let mut source =
            SimulatorSource::new(fast_settings(), TimingMode::Interval, 360_000.0);
        source.connect().await.unwrap();

        let (tx, rx) = async_channel::bounded(16);
        source.start(tx);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        source.stop();
        // Interval raw times are single-lap durations, bounded by the config
        assert!(event.raw_time >= 0.8 && event.raw_time <= 2.2);
    }

    #[test]
    fn test_status_reflects_state() {
        let source = SimulatorSource::new(fast_settings(), TimingMode::Duration, 360_000.0);
        let status = source.status();
        assert_eq!(status.source_type, SourceType::Simulator);
        assert!(!status.connected);
        assert!(!status.reading);
    }
}
