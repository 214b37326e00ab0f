//! # Station
//!
//! Timing station daemon: owns one hardware or simulated crossing source,
//! normalizes frames through the shared decoder, persists every crossing to
//! a durable relay queue before any network I/O, and drains the queue to the
//! server over a persistent authenticated channel.
//!
//! The station is intentionally "dumb": it relays what the decoder reports
//! (transponder id, timestamp, raw time) and leaves every race/team/lap
//! decision to the server.

mod daemon;
mod network;
mod serial;
mod simulator;
mod source;

pub use daemon::{DaemonStatus, LinkState, StationDaemon};
pub use network::NetworkSource;
pub use serial::SerialSource;
pub use simulator::SimulatorSource;
pub use source::{send_event, SourcePlugin, SourceStatus};
