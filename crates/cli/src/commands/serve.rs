//! `serve` command - run the ingestion server.
//!
//! Round data (races, teams, transponder assignments) comes from a JSON
//! bootstrap file; in a full deployment the registration system would hand
//! the same records over through the storage boundary.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use contracts::{ChampionshipDefaults, Race, Round, TeamEntry, TransponderAssignment};
use ingest::{run_server, IngestConfig, IngestionEngine, MemoryLapStore, ServerConfig};
use race_core::{LifecycleConfig, RoundState};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::cli::ServeArgs;

/// Shape of the round bootstrap file.
#[derive(Debug, Deserialize)]
struct RoundSpec {
    round: Round,
    races: Vec<Race>,
    teams: Vec<TeamEntry>,
    #[serde(default)]
    assignments: Vec<TransponderAssignment>,
    #[serde(default)]
    championship: ChampionshipDefaults,
}

pub async fn run_serve(args: &ServeArgs) -> Result<()> {
    let settings = ConfigLoader::load_server(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let spec: RoundSpec = serde_json::from_str(
        &std::fs::read_to_string(&args.round)
            .with_context(|| format!("reading {}", args.round.display()))?,
    )
    .with_context(|| format!("parsing {}", args.round.display()))?;

    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
    }

    info!(
        round_id = spec.round.id,
        races = spec.races.len(),
        teams = spec.teams.len(),
        assignments = spec.assignments.len(),
        "round loaded"
    );

    let lifecycle = LifecycleConfig {
        false_start_grace: settings.false_start_grace_secs,
        false_restart_grace: settings.false_restart_grace_secs,
    };
    let state = RoundState::with_config(spec.round, spec.races, lifecycle);

    let ingest_config = IngestConfig {
        dedup_window_secs: settings.dedup_window_secs,
        suspicious_multiplier: settings.suspicious_multiplier,
        suspicious_min_samples: settings.suspicious_min_samples,
        leaderboard_debounce_secs: settings.leaderboard_debounce_secs,
    };
    let engine = IngestionEngine::new(
        ingest_config,
        spec.championship,
        state,
        spec.teams,
        spec.assignments,
        MemoryLapStore::new(),
    );

    let server_config = ServerConfig {
        bind_addr: settings
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind_addr '{}'", settings.bind_addr))?,
        events_bind_addr: settings
            .events_bind_addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("invalid events_bind_addr '{addr}'"))
            })
            .transpose()?,
        hmac_secret: settings.hmac_secret,
        tick_interval_secs: settings.tick_interval_secs,
        leaderboard_debounce_secs: settings.leaderboard_debounce_secs,
    };

    let (events_tx, _) = broadcast::channel(256);
    info!(bind = %server_config.bind_addr, "starting ingestion server");
    run_server(server_config, engine, events_tx)
        .await
        .context("ingestion server failed")?;
    Ok(())
}
