//! # Relay Queue
//!
//! Durable, ordered, at-least-once delivery buffer between one producer and
//! one consumer. Both the timing station daemon (server-bound) and the
//! fan-out proxy (client-bound, one queue per downstream client) persist
//! every payload here before any network I/O, so crossings survive crashes
//! and reconnects.
//!
//! Storage is an append-only JSON-lines journal: `entry` records on enqueue,
//! cumulative `ack` records on acknowledgment. Startup replays the journal;
//! compaction rewrites it once enough acked history has accumulated.

mod queue;

pub use queue::{QueueStats, RelayQueue, DEFAULT_COMPACT_THRESHOLD};
