//! Per-lobby simulation binary, spawned by the broker.
//!
//! Usage:
//!   blitz-sim --lobby CODE [--udp-port 0] [--control-port N] [--tick-hz 30]
//!
//! Binds the game socket (ephemeral port unless told otherwise), reports
//! "ready with port N" on the control channel, then runs the fixed-rate
//! tick loop until told to shut down or the lobby drains.

use std::env;

use anyhow::Context;
use blitz_shared::{config::GameConfig, ipc::ControlChannel, lobby::LobbyCode};
use blitz_sim::UdpGameServer;
use tracing::info;

struct Args {
    lobby: LobbyCode,
    udp_port: u16,
    control_port: Option<u16>,
    tick_hz: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut lobby = None;
    let mut udp_port = 0;
    let mut control_port = None;
    let mut tick_hz = GameConfig::default().tick_hz;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--lobby" if i + 1 < args.len() => {
                lobby = LobbyCode::parse(&args[i + 1]);
                i += 2;
            }
            "--udp-port" if i + 1 < args.len() => {
                udp_port = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--control-port" if i + 1 < args.len() => {
                control_port = args[i + 1].parse().ok();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                tick_hz = args[i + 1].parse().unwrap_or(tick_hz);
                i += 2;
            }
            _ => i += 1,
        }
    }

    Ok(Args {
        lobby: lobby.context("--lobby CODE is required")?,
        udp_port,
        control_port,
        tick_hz,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let cfg = GameConfig {
        tick_hz: args.tick_hz,
        ..GameConfig::default()
    };

    let control = match args.control_port {
        Some(port) => Some(
            ControlChannel::connect_local(port)
                .await
                .context("connect control channel")?,
        ),
        None => None,
    };

    // Seed from the lobby code so two lobbies never share a spawn script.
    let seed = args
        .lobby
        .as_bytes()
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));

    info!(lobby = %args.lobby, tick_hz = cfg.tick_hz, "starting simulation");
    let (server, port) =
        UdpGameServer::bind(args.lobby, args.udp_port, &cfg, control, seed).await?;
    info!(lobby = %args.lobby, port, "simulation bound");

    server.run().await
}
