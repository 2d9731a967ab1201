//! `blitz_sim`
//!
//! The authoritative simulation for exactly one lobby:
//! - Game world state and fixed-timestep tick logic
//! - The UDP transport loop that feeds it and broadcasts snapshots
//!
//! One instance runs per lobby, in its own process, supervised by the
//! broker over a control channel.

pub mod server;
pub mod world;

pub use server::UdpGameServer;
pub use world::GameWorld;
