//! Configuration system.
//!
//! Loads configuration from JSON strings/files (file IO left to the app).
//! One struct is shared by broker, simulation and client; fields irrelevant
//! to a given binary are simply unused there.

use serde::{Deserialize, Serialize};

/// Root configuration shared by broker/sim/client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Broker listen address, e.g. `127.0.0.1:4242`.
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Player cap per lobby.
    #[serde(default = "default_max_lobby_players")]
    pub max_lobby_players: usize,
    /// Member count at which a lobby is delegated to its own process.
    #[serde(default = "default_min_players_to_start")]
    pub min_players_to_start: usize,
    /// UDP silence after which a client is evicted from the simulation.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: f32,
    /// Broker heartbeat cadence.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// PONG silence after which a TCP client is dropped.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Time allowed between accept and a valid CLIENT_HELLO.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Time allowed for a spawned child to report ready.
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,
    /// Grace between a shutdown request and a hard kill.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Simulation binary path; defaults to `blitz-sim` next to the broker.
    #[serde(default)]
    pub sim_binary: Option<String>,
    /// Display name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
}

fn default_tcp_addr() -> String {
    "127.0.0.1:4242".to_string()
}

fn default_tick_hz() -> u32 {
    30
}

fn default_max_lobby_players() -> usize {
    4
}

fn default_min_players_to_start() -> usize {
    1
}

fn default_client_timeout_secs() -> f32 {
    5.0
}

fn default_ping_interval_secs() -> u64 {
    5
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    3
}

fn default_spawn_timeout_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    3
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_tcp_addr(),
            tick_hz: default_tick_hz(),
            max_lobby_players: default_max_lobby_players(),
            min_players_to_start: default_min_players_to_start(),
            client_timeout_secs: default_client_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            spawn_timeout_secs: default_spawn_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sim_binary: None,
            player_name: default_player_name(),
        }
    }
}

impl GameConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Seconds per simulation tick.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_hz as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = GameConfig::from_json_str(r#"{"tick_hz": 60}"#).unwrap();
        assert_eq!(cfg.tick_hz, 60);
        assert_eq!(cfg.max_lobby_players, 4);
        assert_eq!(cfg.tcp_addr, "127.0.0.1:4242");
    }
}
