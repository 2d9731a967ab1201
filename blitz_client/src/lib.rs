//! `blitz_client`
//!
//! Headless client-side systems:
//! - TCP connection management (handshake, lobby commands, heartbeat)
//! - UDP gameplay traffic (hello, input, shoot, snapshots, latency probes)
//!
//! Consumes snapshots read-only; owns no authoritative state and renders
//! nothing. Doubles as the driver for integration tests.

pub mod client;
pub mod input;

pub use client::{GameClient, LobbyTicket};
