//! Full socket-based scenarios: handshake, lobby brokering, delegation and
//! authoritative movement.

use std::time::Duration;

use blitz_client::GameClient;
use blitz_shared::{input::Buttons, lobby::LobbyCode};
use blitz_sim::world::PLAYER_SPEED;
use blitz_tests::{start_broker, test_config, LaunchMode};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_join_and_authoritative_movement() -> anyhow::Result<()> {
    init_logs();
    let addr = start_broker(test_config(), LaunchMode::Normal).await?;

    // Session A creates a lobby; with the minimum at one member it is
    // delegated immediately and the ticket carries a live endpoint.
    let mut a = GameClient::connect(addr, "Ace").await?;
    let ticket = a.create_lobby().await?;
    assert!(ticket.is_delegated());

    // Session B joins by code and lands on the same endpoint.
    let mut b = GameClient::connect(addr, "Bandit").await?;
    let ticket_b = b.join_lobby(ticket.code).await?;
    assert_eq!(ticket_b.code, ticket.code);
    assert_eq!(ticket_b.udp_port, ticket.udp_port);

    // Membership changes reach both members.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while a.roster.len() < 2 && tokio::time::Instant::now() < deadline {
        a.poll_tcp(Duration::from_millis(50)).await?;
    }
    let names: Vec<&str> = a.roster.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"Ace") && names.contains(&"Bandit"), "roster: {names:?}");

    // Both switch to UDP.
    a.hello_udp().await?;
    b.hello_udp().await?;

    // One INPUT with RIGHT set moves the player by exactly velocity * dt in
    // the authoritative state (the input is consumed by a single tick).
    let dt = 1.0 / test_config().tick_hz as f32;
    let x0 = a.own_player().expect("own player in snapshot").pos.x;
    a.send_input(Buttons::RIGHT).await?;
    for _ in 0..10 {
        if a.recv_snapshot(Duration::from_millis(300)).await?.is_none() {
            break;
        }
        let x = a.own_player().expect("own player").pos.x;
        if (x - x0).abs() > f32::EPSILON {
            break;
        }
    }
    // Let a couple more snapshots land to prove the input does not repeat.
    for _ in 0..3 {
        let _ = a.recv_snapshot(Duration::from_millis(200)).await?;
    }
    let x1 = a.own_player().expect("own player").pos.x;
    assert!(
        (x1 - x0 - PLAYER_SPEED * dt).abs() < 1e-3,
        "expected exactly one tick of movement, got {x0} -> {x1}"
    );

    // Chat relays to the whole lobby with the sender's name.
    a.say("hello there").await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        b.poll_tcp(Duration::from_millis(50)).await?;
        if b.messages.iter().any(|m| m == "CHAT:Ace: hello there") {
            break;
        }
    }
    assert!(
        b.messages.iter().any(|m| m == "CHAT:Ace: hello there"),
        "messages: {:?}",
        b.messages
    );

    // The latency probe answers outside the tick cadence.
    let rtt = a.ping_udp(Duration::from_secs(1)).await?;
    assert!(rtt.is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_full_lobby_is_refused_without_membership_change() -> anyhow::Result<()> {
    init_logs();
    let addr = start_broker(test_config(), LaunchMode::Normal).await?;

    let mut a = GameClient::connect(addr, "Ace").await?;
    let ticket = a.create_lobby().await?;
    let mut b = GameClient::connect(addr, "Bandit").await?;
    b.join_lobby(ticket.code).await?;

    // The lobby caps at two; a third join is refused.
    let mut c = GameClient::connect(addr, "Crash").await?;
    let err = c.join_lobby(ticket.code).await.unwrap_err();
    assert!(err.to_string().contains("Full"), "got: {err}");

    // Membership is unchanged for the members.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while a.roster.len() < 2 && tokio::time::Instant::now() < deadline {
        a.poll_tcp(Duration::from_millis(50)).await?;
    }
    assert_eq!(a.roster.len(), 2);
    assert!(!a.roster.iter().any(|e| e.name == "Crash"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_unknown_code_is_refused() -> anyhow::Result<()> {
    init_logs();
    let addr = start_broker(test_config(), LaunchMode::Normal).await?;

    let mut a = GameClient::connect(addr, "Ace").await?;
    let err = a
        .join_lobby(LobbyCode::parse("ZZZZ99").unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NotFound"), "got: {err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delegation_waits_for_member_minimum() -> anyhow::Result<()> {
    init_logs();
    let mut cfg = test_config();
    cfg.min_players_to_start = 2;
    let addr = start_broker(cfg, LaunchMode::Normal).await?;

    // Alone in the lobby: acknowledged, but no endpoint yet.
    let mut a = GameClient::connect(addr, "Ace").await?;
    let ticket = a.create_lobby().await?;
    assert!(!ticket.is_delegated());

    // The second member tips the lobby over the minimum; both get the
    // endpoint relayed.
    let mut b = GameClient::connect(addr, "Bandit").await?;
    let ticket_b = b.join_lobby(ticket.code).await?;
    assert!(ticket_b.is_delegated());

    let ticket_a = a.wait_delegated(Duration::from_secs(3)).await?;
    assert_eq!(ticket_a.udp_port, ticket_b.udp_port);
    Ok(())
}
