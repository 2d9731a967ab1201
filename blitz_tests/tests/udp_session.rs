//! Control-channel lifecycle against the real simulation loop: ready
//! report, roster attach, hello gating, timeout eviction and self-drain.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;

use blitz_shared::{
    config::GameConfig,
    ipc::{ControlChannel, ControlMsg},
    lobby::{LobbyCode, SessionId},
    net::{udp_recv_timeout, udp_send},
    packet::Packet,
};
use blitz_sim::UdpGameServer;

fn fast_cfg() -> GameConfig {
    GameConfig {
        tick_hz: 60,
        client_timeout_secs: 0.3,
        ..GameConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_hello_evict_drain_lifecycle() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let mut parent = ControlChannel::bind_local().await?;
    let child = ControlChannel::connect_local(parent.local_port()?).await?;
    let lobby = LobbyCode::parse("ABC123").unwrap();
    let (server, _) = UdpGameServer::bind(lobby, 0, &fast_cfg(), Some(child), 7).await?;
    let sim = tokio::spawn(server.run());

    // The child opens with its ready report.
    let udp_port = match parent.recv_timeout(Duration::from_secs(2)).await? {
        Some(ControlMsg::Ready { udp_port }) => udp_port,
        other => panic!("expected ready, got {other:?}"),
    };
    let game_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), udp_port);

    let session = SessionId(5);
    parent.send(&ControlMsg::Attach { session }).await?;

    // A hello for a never-attached session gets nothing back.
    let stranger = UdpSocket::bind("127.0.0.1:0").await?;
    udp_send(
        &stranger,
        &Packet::HelloUdp {
            session: SessionId(99),
        },
        game_addr,
    )
    .await?;
    assert!(
        udp_recv_timeout(&stranger, Duration::from_millis(200))
            .await?
            .is_none(),
        "unattached sender must never be acknowledged"
    );

    // The attached session registers and gets a snapshot immediately.
    let player = UdpSocket::bind("127.0.0.1:0").await?;
    udp_send(&player, &Packet::HelloUdp { session }, game_addr).await?;
    let (first, _) = udp_recv_timeout(&player, Duration::from_secs(1))
        .await?
        .expect("snapshot after hello");
    match first {
        Packet::Snapshot(s) => {
            assert_eq!(s.players.len(), 1);
            assert_eq!(s.players[0].session, session);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    // Going silent past the timeout evicts the client and, with nobody
    // left, the simulation reports the empty lobby and drains itself.
    let mut dropped = false;
    let mut no_players = false;
    let deadline = time::Instant::now() + Duration::from_secs(3);
    while time::Instant::now() < deadline && !(dropped && no_players) {
        match parent.recv_timeout(Duration::from_millis(200)).await? {
            Some(ControlMsg::Dropped { session: s }) if s == session => dropped = true,
            Some(ControlMsg::NoPlayers) => no_players = true,
            _ => {}
        }
    }
    assert!(dropped, "expected a dropped report");
    assert!(no_players, "expected a no-players report");

    // The loop exits on its own after the drain.
    let result = time::timeout(Duration::from_secs(2), sim).await;
    assert!(result.is_ok(), "simulation task should have exited");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_request_stops_the_loop() -> anyhow::Result<()> {
    let mut parent = ControlChannel::bind_local().await?;
    let child = ControlChannel::connect_local(parent.local_port()?).await?;
    let lobby = LobbyCode::parse("ABC124").unwrap();
    let (server, _) = UdpGameServer::bind(lobby, 0, &fast_cfg(), Some(child), 7).await?;
    let sim = tokio::spawn(server.run());

    match parent.recv_timeout(Duration::from_secs(2)).await? {
        Some(ControlMsg::Ready { .. }) => {}
        other => panic!("expected ready, got {other:?}"),
    }

    parent.send(&ControlMsg::Shutdown).await?;
    let result = time::timeout(Duration::from_secs(2), sim).await;
    assert!(result.is_ok(), "simulation should stop on shutdown request");
    Ok(())
}
