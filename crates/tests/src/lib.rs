//! # Integration Tests
//!
//! End-to-end tests across crate boundaries:
//! - station wire protocol against the live ingestion server
//! - the full daemon (simulator source, durable queue, uplink) against the server
//! - the fan-out proxy against a fake single-endpoint decoder

#[cfg(test)]
mod helpers {
    use chrono::{DateTime, TimeZone, Utc};
    use contracts::{
        ChampionshipDefaults, CrossingEvent, EndingMode, Race, Round, StartMode, StationMessage,
        TeamEntry, TransponderAssignment,
    };
    use ingest::{IngestConfig, IngestionEngine, MemoryLapStore};
    use race_core::RoundState;

    pub const SECRET: &str = "e2e_test_secret";

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Three teams, two redundant transponders each.
    pub fn teams() -> Vec<TeamEntry> {
        (1..=3)
            .map(|i| TeamEntry {
                team_id: i,
                number: 10 + i as u32,
                driver_weight_kg: Some(70.0 + i as f64),
                retired: false,
            })
            .collect()
    }

    pub fn assignments(race_id: u64) -> Vec<TransponderAssignment> {
        (1..=3)
            .map(|i| TransponderAssignment {
                race_id,
                team_id: i,
                kart_number: 10 + i as u32,
                transponder_ids: vec![
                    format!("{:06}", 100_000 + i * 10).into(),
                    format!("{:06}", 100_001 + i * 10).into(),
                ],
            })
            .collect()
    }

    pub fn engine(
        mode: EndingMode,
        lap_count: Option<u32>,
        started: Option<DateTime<Utc>>,
        dedup_window_secs: f64,
    ) -> IngestionEngine<MemoryLapStore> {
        let race = Race {
            id: 1,
            round_id: 1,
            sequence_number: 1,
            ending_mode: mode,
            start_mode: StartMode::Immediate,
            time_limit_override: Some(3600.0),
            lap_count_override: lap_count,
            count_crossings_during_suspension: false,
            ready: true,
            started,
            ended: None,
            depends_on_race: None,
        };
        let round = Round {
            id: 1,
            started,
            ended: None,
            pauses: vec![],
            time_limit_adjustment: None,
            lap_count_adjustment: None,
        };
        IngestionEngine::new(
            IngestConfig {
                dedup_window_secs,
                ..IngestConfig::default()
            },
            ChampionshipDefaults::default(),
            RoundState::new(round, vec![race]),
            teams(),
            assignments(1),
            MemoryLapStore::new(),
        )
    }

    pub fn crossing_message(
        sequence_id: u64,
        transponder_id: &str,
        timestamp: DateTime<Utc>,
    ) -> StationMessage {
        StationMessage::LapCrossing {
            sequence_id,
            event: CrossingEvent {
                transponder_id: transponder_id.into(),
                timestamp,
                raw_time: (timestamp - at(0)).as_seconds_f64(),
                signal_strength: 90,
                source_sequence: None,
            },
        }
    }
}

#[cfg(test)]
mod server_e2e {
    use super::helpers::*;
    use contracts::{
        sign_message, verify_message, EndingMode, RaceEvent, ServerMessage, StationMessage,
        TimingMode,
    };
    use ingest::{run_server, ServerConfig};
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast;
    use tokio::time::{timeout, Duration};

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn send_signed(
        stream: &mut TcpStream,
        message: &StationMessage,
    ) -> std::io::Result<()> {
        let mut value = serde_json::to_value(message).unwrap();
        sign_message(&mut value, SECRET.as_bytes()).unwrap();
        stream.write_all(value.to_string().as_bytes()).await?;
        stream.write_all(b"\n").await
    }

    /// Spec scenario: 3 teams, 2 redundant transponders each, CROSS_AFTER_LAPS
    /// at 5 laps. Each team finishes independently once it has 5 laps and a
    /// subsequent crossing; the race ends when all have.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_cross_after_laps_full_protocol() {
        let addr = free_addr().await;
        let engine = engine(EndingMode::CrossAfterLaps, Some(5), Some(at(0)), 7.0);
        let (events_tx, mut events_rx) = broadcast::channel::<RaceEvent>(1024);

        let config = ServerConfig {
            bind_addr: addr,
            events_bind_addr: None,
            hmac_secret: SECRET.to_string(),
            tick_interval_secs: 0.5,
            leaderboard_debounce_secs: 0.0,
        };
        tokio::spawn(run_server(config, engine, events_tx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_signed(
            &mut stream,
            &StationMessage::Connected {
                plugin_type: contracts::SourceType::Simulator,
                timing_mode: TimingMode::Duration,
                rollover_seconds: 360_000.0,
                timestamp: at(0),
            },
        )
        .await
        .unwrap();

        // 6 crossings per team: the 6th (after 5 completed laps) finishes the
        // team. Transponders alternate to exercise the redundancy mapping;
        // team i uses ids 1000i0 / 1000i1.
        let mut sequence = 0u64;
        for lap in 0..6i64 {
            for team in 1..=3i64 {
                sequence += 1;
                let tid = format!("{:06}", 100_000 + team * 10 + (lap % 2));
                // 60s laps, offset a few seconds per team
                let ts = at(60 * (lap + 1) + team * 3);
                send_signed(&mut stream, &crossing_message(sequence, &tid, ts))
                    .await
                    .unwrap();
            }
        }

        // Every envelope gets an authenticated cumulative ack
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut acked = 0u64;
        timeout(Duration::from_secs(10), async {
            while acked < sequence {
                let line = lines.next_line().await.unwrap().unwrap();
                let mut value: serde_json::Value = serde_json::from_str(&line).unwrap();
                verify_message(&mut value, SECRET.as_bytes()).unwrap();
                let message: ServerMessage = serde_json::from_value(value).unwrap();
                if let ServerMessage::Ack { sequence_id } = message {
                    acked = acked.max(sequence_id);
                }
            }
        })
        .await
        .expect("all crossings should be acked");

        // Teams finish independently, then the race ends for everyone
        let mut finished_teams = HashSet::new();
        let mut race_finished = false;
        timeout(Duration::from_secs(10), async {
            while !race_finished {
                match events_rx.recv().await {
                    Ok(RaceEvent::RaceFinished { team_id: Some(team), .. }) => {
                        finished_teams.insert(team);
                    }
                    Ok(RaceEvent::RaceFinished { team_id: None, .. }) => {
                        race_finished = true;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
        .await
        .expect("race should finish");

        assert_eq!(finished_teams, HashSet::from([1, 2, 3]));
        assert!(race_finished);
    }

    /// Redundant transponders within the dedup window produce one lap, and
    /// unauthenticated messages are dropped without killing the connection.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_dedup_and_auth_over_the_wire() {
        let addr = free_addr().await;
        // Clock starts now so the TIME_ONLY limit stays far away
        let engine = engine(EndingMode::TimeOnly, None, Some(chrono::Utc::now()), 7.0);
        let (events_tx, mut events_rx) = broadcast::channel::<RaceEvent>(256);

        let config = ServerConfig {
            bind_addr: addr,
            events_bind_addr: None,
            hmac_secret: SECRET.to_string(),
            tick_interval_secs: 30.0,
            leaderboard_debounce_secs: 0.0,
        };
        tokio::spawn(run_server(config, engine, events_tx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();

        // Forged message: valid JSON, wrong signature
        let mut forged = serde_json::to_value(&crossing_message(99, "100010", at(60))).unwrap();
        sign_message(&mut forged, b"wrong_secret").unwrap();
        stream
            .write_all(format!("{forged}\n").as_bytes())
            .await
            .unwrap();

        // Both transponders of team 1 cross within the window
        send_signed(&mut stream, &crossing_message(1, "100010", at(60)))
            .await
            .unwrap();
        send_signed(&mut stream, &crossing_message(2, "100011", at(63)))
            .await
            .unwrap();

        let update = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(RaceEvent::RaceLapUpdate { team_number, lap_number, .. }) =
                    events_rx.recv().await
                {
                    return (team_number, lap_number);
                }
            }
        })
        .await
        .expect("one lap update should arrive");
        assert_eq!(update, (11, 1));

        // The forged sequence id 99 must never be acked; the duplicate (2) is
        // acked because the server processed (and dropped) it.
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let acked = timeout(Duration::from_secs(5), async {
            let mut highest = 0u64;
            while highest < 2 {
                let line = lines.next_line().await.unwrap().unwrap();
                let mut value: serde_json::Value = serde_json::from_str(&line).unwrap();
                verify_message(&mut value, SECRET.as_bytes()).unwrap();
                if let ServerMessage::Ack { sequence_id } = serde_json::from_value(value).unwrap() {
                    highest = highest.max(sequence_id);
                }
            }
            highest
        })
        .await
        .expect("acks should arrive");
        assert_eq!(acked, 2);
    }
}

#[cfg(test)]
mod daemon_e2e {
    use super::helpers::*;
    use contracts::{
        DaemonSettings, EndingMode, PluginSettings, RaceEvent, SimulatorSettings, SourceType,
        StationSettings, TimingMode,
    };
    use ingest::{run_server, ServerConfig};
    use station::StationDaemon;
    use tokio::net::TcpListener;
    use tokio::sync::{broadcast, watch};
    use tokio::time::{timeout, Duration};

    /// Full stack: simulator source -> durable queue -> authenticated uplink
    /// -> ingestion server -> broadcast lap updates.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_daemon_to_server_pipeline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        // Race clock starts now: simulator timestamps are wall-clock
        let engine = engine(
            EndingMode::TimeOnly,
            None,
            Some(chrono::Utc::now()),
            // Simulated laps are sub-second; a real dedup window would eat them
            0.05,
        );
        let (events_tx, mut events_rx) = broadcast::channel::<RaceEvent>(1024);
        let config = ServerConfig {
            bind_addr: addr,
            events_bind_addr: None,
            hmac_secret: SECRET.to_string(),
            tick_interval_secs: 30.0,
            leaderboard_debounce_secs: 0.0,
        };
        tokio::spawn(run_server(config, engine, events_tx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let dir = tempfile::tempdir().unwrap();
        let settings = StationSettings {
            daemon: DaemonSettings {
                server_addr: addr.to_string(),
                hmac_secret: SECRET.to_string(),
                reconnect_interval_secs: 0.2,
                resend_interval_secs: 1.0,
                queue_path: dir.path().join("relay.jsonl"),
                timing_mode: TimingMode::Duration,
                rollover_seconds: 360_000.0,
            },
            plugin: PluginSettings {
                source_type: SourceType::Simulator,
                simulator: SimulatorSettings {
                    num_transponders: 0,
                    lap_time_min: 0.5,
                    lap_time_max: 1.0,
                    lap_time_variance: 0.1,
                    // Team 1's transponders from the shared fixture
                    transponder_ids: vec!["100010".to_string(), "100011".to_string()],
                    sim_speed: 50.0,
                },
                serial: Default::default(),
                network: Default::default(),
            },
        };

        let daemon = StationDaemon::new(settings).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let daemon_task = tokio::spawn(daemon.run(shutdown_rx));

        // Simulated crossings must come out the far end as lap updates
        let mut updates = 0;
        timeout(Duration::from_secs(15), async {
            while updates < 3 {
                if let Ok(RaceEvent::RaceLapUpdate { team_number, .. }) = events_rx.recv().await {
                    assert_eq!(team_number, 11);
                    updates += 1;
                }
            }
        })
        .await
        .expect("lap updates should flow end to end");

        shutdown_tx.send(true).unwrap();
        let _ = timeout(Duration::from_secs(3), daemon_task).await;
    }
}

#[cfg(test)]
mod proxy_e2e {
    use contracts::{
        NetProtocol, NetworkSettings, ProxyClientSettings, ProxySettings, RelayEnvelope,
    };
    use fanout::FanoutProxy;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio::sync::watch;
    use tokio::time::{timeout, Duration};

    /// A single-endpoint UDP decoder feeds the proxy; two clients receive the
    /// same crossing independently and the decoder gets its hardware ACK.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_proxy_fans_out_one_decoder_feed() {
        let dir = tempfile::tempdir().unwrap();

        // Reserve ports
        let upstream_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_sock.local_addr().unwrap().port();
        drop(upstream_sock);
        let reserve_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = reserve_a.local_addr().unwrap().to_string();
        drop(reserve_a);
        let reserve_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = reserve_b.local_addr().unwrap().to_string();
        drop(reserve_b);

        let settings = ProxySettings {
            upstream: NetworkSettings {
                host: "127.0.0.1".to_string(),
                port: upstream_port,
                protocol: NetProtocol::Udp,
                endian: contracts::Endianness::Normal,
            },
            clients: vec![
                ProxyClientSettings {
                    name: "leaderboard".to_string(),
                    listen_addr: addr_a.clone(),
                },
                ProxyClientSettings {
                    name: "race_control".to_string(),
                    listen_addr: addr_b.clone(),
                },
            ],
            resend_interval_secs: 1.0,
            queue_dir: dir.path().join("queues"),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let proxy_task = tokio::spawn(FanoutProxy::new(settings).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Connect both downstream clients
        let stream_a = TcpStream::connect(&addr_a).await.unwrap();
        let (read_a, mut write_a) = stream_a.into_split();
        let mut lines_a = BufReader::new(read_a).lines();
        let stream_b = TcpStream::connect(&addr_b).await.unwrap();
        let (read_b, _write_b) = stream_b.into_split();
        let mut lines_b = BufReader::new(read_b).lines();

        // Play the decoder: one frame to the proxy's single endpoint
        let decoder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        decoder
            .send_to(
                b"<STA 023066 80:27'53\"016 01 01 01 3 1569>",
                ("127.0.0.1", upstream_port),
            )
            .await
            .unwrap();

        // Decoder gets the hardware ACK
        let mut ack_buf = [0u8; 8];
        let (n, _) = timeout(Duration::from_secs(3), decoder.recv_from(&mut ack_buf))
            .await
            .expect("decoder should be acked")
            .unwrap();
        assert_eq!(&ack_buf[..n], &[0x1B, 0x11]);

        // Both clients get the same decoded crossing
        for lines in [&mut lines_a, &mut lines_b] {
            let line = timeout(Duration::from_secs(3), lines.next_line())
                .await
                .expect("client should receive the crossing")
                .unwrap()
                .unwrap();
            let envelope: RelayEnvelope = serde_json::from_str(&line).unwrap();
            assert_eq!(envelope.sequence_id, 1);
            match envelope.payload {
                contracts::RelayPayload::Crossing(event) => {
                    assert_eq!(event.transponder_id, "023066");
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        // Client A acks; client B stays behind and only grows its own queue
        write_a.write_all(b"{\"ack\":1}\n").await.unwrap();

        let _ = shutdown_tx.send(true);
        let _ = timeout(Duration::from_secs(3), proxy_task).await;
    }
}
