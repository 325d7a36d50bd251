//! Monitoring agent sessions
//!
//! Everything above the raw transport: who the agent is, which collectors it talks to
//! and what it answers.
//!
//! # Architecture
//!
//! - **Stream**: resolves one SRV query per datacenter and dials the preferred collector
//! - **Client**: one session per collector; handshake, heartbeat and inbound dispatch
//! - **Registry**: inbound method name to handler, built once and shared by every client
//! - **Host info**: the `host_info.get` handler (memory, CPU, filesystems, processes)
//!
//! # Session lifecycle
//!
//! `Connected -> Handshaking -> Active -> Closed`. A rejected handshake drops back to
//! `Connected`; nothing is retried. `Closed` is only reached when the connection goes away.
pub mod client;
pub mod config;
pub mod discovery;
pub mod host_info;
pub mod registry;
pub mod stream;
pub mod types;
