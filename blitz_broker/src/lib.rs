//! `blitz_broker`
//!
//! The TCP lobby broker: accepts clients, drives the hello handshake and
//! lobby commands, and delegates live lobbies to isolated simulation
//! processes through the supervisor.

pub mod broker;
pub mod supervisor;

pub use broker::Broker;
pub use supervisor::{
    ChildCommand, ChildEvent, ChildState, Launcher, LobbyChild, ProcessSupervisor, SpawnError,
};
