//! A lobby process dying unexpectedly must evict the lobby and surface the
//! failure to its TCP members, without touching the rest of the broker.

use std::time::Duration;

use blitz_client::GameClient;
use blitz_tests::{start_broker, test_config, LaunchMode};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_evicts_lobby_and_notifies_members() -> anyhow::Result<()> {
    init_logs();
    let addr = start_broker(
        test_config(),
        LaunchMode::CrashAfter(Duration::from_millis(300)),
    )
    .await?;

    let mut a = GameClient::connect(addr, "Ace").await?;
    let ticket = a.create_lobby().await?;
    assert!(ticket.is_delegated());
    a.hello_udp().await?;

    // The simulated crash lands within one monitoring interval; the member
    // sees LOBBY_ERROR and is disconnected.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut evicted = false;
    while tokio::time::Instant::now() < deadline {
        match a.poll_tcp(Duration::from_millis(100)).await {
            Ok(()) => {}
            Err(e) => {
                let text = e.to_string();
                evicted = text.contains("Crashed") || text.contains("tcp read");
                break;
            }
        }
    }
    assert!(evicted, "member was never evicted");

    // The broker itself survives: a fresh client can still connect and
    // open a new lobby.
    let mut b = GameClient::connect(addr, "Bandit").await?;
    let err = b.create_lobby().await;
    // The replacement lobby crashes too (same launcher), but the broker
    // accepted the session and processed the command either way.
    match err {
        Ok(ticket) => assert!(ticket.is_delegated()),
        Err(e) => assert!(e.to_string().contains("SpawnFailed") || e.to_string().contains("lobby")),
    }
    Ok(())
}
