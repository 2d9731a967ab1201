//! Headless demo bot.
//!
//! Usage:
//!   blitz-bot [--addr 127.0.0.1:4242] [--name Bot] [--join CODE] [--ticks 300]
//!
//! Connects, creates (or joins) a lobby, then flies right and shoots for a
//! while, logging what the authoritative server reports back.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use blitz_client::input::InputState;
use blitz_client::GameClient;
use blitz_shared::lobby::LobbyCode;
use tracing::info;

struct Args {
    addr: SocketAddr,
    name: String,
    join: Option<LobbyCode>,
    ticks: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut addr = "127.0.0.1:4242".to_string();
    let mut name = "Bot".to_string();
    let mut join = None;
    let mut ticks = 300;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                name = args[i + 1].clone();
                i += 2;
            }
            "--join" if i + 1 < args.len() => {
                join = LobbyCode::parse(&args[i + 1]);
                i += 2;
            }
            "--ticks" if i + 1 < args.len() => {
                ticks = args[i + 1].parse().unwrap_or(300);
                i += 2;
            }
            _ => i += 1,
        }
    }

    Ok(Args {
        addr: addr.parse().context("parse --addr")?,
        name,
        join,
        ticks,
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
    let mut client = GameClient::connect(args.addr, &args.name).await?;

    let ticket = match args.join {
        Some(code) => client.join_lobby(code).await?,
        None => client.create_lobby().await?,
    };
    info!(code = %ticket.code, "in lobby");

    let ticket = client.wait_delegated(Duration::from_secs(10)).await?;
    info!(udp_port = ticket.udp_port, "lobby delegated");

    let first = client.hello_udp().await?;
    info!(players = first.players.len(), "registered with simulation");

    for tick in 0..args.ticks {
        let input = InputState {
            right: tick % 40 < 20,
            down: tick % 80 >= 40,
            shoot: tick % 4 == 0,
            ..InputState::default()
        };
        client.send_input(input.buttons()).await?;
        if let Some(snap) = client.recv_snapshot(Duration::from_millis(100)).await? {
            if tick % 30 == 0 {
                let me = snap.players.iter().find(|p| p.session == client.session);
                info!(
                    tick = snap.tick,
                    pos = ?me.map(|p| (p.pos.x, p.pos.y)),
                    hp = me.map(|p| p.hp),
                    monsters = snap.monsters.len(),
                    bullets = snap.bullets.len(),
                    "snapshot"
                );
            }
        }
        client.poll_tcp(Duration::from_millis(1)).await?;
        tokio::time::sleep(Duration::from_millis(33)).await;
    }

    if let Some(rtt) = client.ping_udp(Duration::from_secs(1)).await? {
        info!(rtt_ms = rtt.as_millis() as u64, "latency probe");
    }
    for msg in &client.messages {
        info!(message = %msg, "server message");
    }
    Ok(())
}
