//! # Fanout
//!
//! Fan-out proxy between a single-endpoint decoder and multiple downstream
//! consumers. Some decoder hardware and network adapters only talk to one
//! remote endpoint; the proxy holds that one upstream connection, decodes
//! each frame once, and replicates the crossing into an independent durable
//! queue per registered downstream client.
//!
//! A slow or disconnected client only grows its own queue - it never blocks
//! the upstream link or its sibling clients. Unacked entries are re-sent on
//! a fixed interval until the client acknowledges them, so a reconnecting
//! client catches up quickly and in order.

mod client;
mod proxy;

pub use client::ClientHandle;
pub use proxy::FanoutProxy;
