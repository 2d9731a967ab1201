//! Lobby broker binary.
//!
//! Usage:
//!   blitz-broker [--addr 127.0.0.1:4242] [--config path.json]
//!                [--sim-bin path/to/blitz-sim] [--min-players 1]
//!
//! Accepts TCP clients, brokers lobbies, and spawns one isolated simulation
//! process per live lobby.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use blitz_broker::{Broker, ProcessSupervisor};
use blitz_shared::config::GameConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<GameConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = GameConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = GameConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                cfg.tcp_addr = args[i + 1].clone();
                i += 2;
            }
            "--sim-bin" if i + 1 < args.len() => {
                cfg.sim_binary = Some(args[i + 1].clone());
                i += 2;
            }
            "--min-players" if i + 1 < args.len() => {
                cfg.min_players_to_start = args[i + 1].parse().unwrap_or(1);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.tcp_addr, min_players = cfg.min_players_to_start, "starting broker");

    let supervisor = Arc::new(ProcessSupervisor::new(&cfg));
    let broker = Broker::bind(cfg, supervisor).await.context("bind broker")?;
    broker.run().await
}
