//! Test harness shared by the integration tests.
//!
//! [`LocalLauncher`] fulfills the broker's launcher seam by running the
//! simulation as an in-process task wired to a real loopback control
//! channel, so tests exercise the exact production control protocol without
//! needing the child binary on disk. A crashing mode simulates a lobby
//! process dying mid-game.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use blitz_broker::{Broker, ChildCommand, ChildEvent, Launcher, LobbyChild, SpawnError};
use blitz_shared::{
    config::GameConfig,
    ipc::{ControlChannel, ControlMsg},
    lobby::LobbyCode,
};
use blitz_sim::UdpGameServer;

/// How the in-process "child" behaves.
#[derive(Debug, Clone, Copy)]
pub enum LaunchMode {
    Normal,
    /// Simulate an unexpected death this long after launch.
    CrashAfter(Duration),
}

/// Runs each lobby's simulation as a supervised in-process task.
pub struct LocalLauncher {
    cfg: GameConfig,
    mode: LaunchMode,
}

impl LocalLauncher {
    pub fn new(cfg: GameConfig, mode: LaunchMode) -> Self {
        Self { cfg, mode }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, lobby: LobbyCode) -> Result<LobbyChild, SpawnError> {
        let mut parent = ControlChannel::bind_local()
            .await
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let parent_port = parent
            .local_port()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let child_chan = ControlChannel::connect_local(parent_port)
            .await
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let (server, _port) = UdpGameServer::bind(lobby, 0, &self.cfg, Some(child_chan), 7)
            .await
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let mode = self.mode;
        let handle: JoinHandle<Result<(), ()>> = tokio::spawn(async move {
            match mode {
                LaunchMode::Normal => server.run().await.map_err(|_| ()),
                LaunchMode::CrashAfter(delay) => {
                    tokio::select! {
                        result = server.run() => result.map_err(|_| ()),
                        _ = time::sleep(delay) => Err(()),
                    }
                }
            }
        });

        // The simulation reports ready with its port before ticking.
        let udp_port = match parent.recv_timeout(Duration::from_secs(2)).await {
            Ok(Some(ControlMsg::Ready { udp_port })) => udp_port,
            Ok(other) => {
                handle.abort();
                return Err(SpawnError::Spawn(format!("expected ready, got {other:?}")));
            }
            Err(e) => {
                handle.abort();
                return Err(SpawnError::Spawn(e.to_string()));
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (evt_tx, evt_rx) = mpsc::channel(64);
        tokio::spawn(monitor_local(lobby, handle, parent, cmd_rx, evt_tx));

        Ok(LobbyChild {
            lobby,
            udp_port,
            events: evt_rx,
            commands: cmd_tx,
        })
    }
}

/// In-process counterpart of the production child monitor.
async fn monitor_local(
    lobby: LobbyCode,
    mut handle: JoinHandle<Result<(), ()>>,
    mut control: ControlChannel,
    mut commands: mpsc::Receiver<ChildCommand>,
    events: mpsc::Sender<ChildEvent>,
) {
    loop {
        tokio::select! {
            result = &mut handle => {
                let crashed = !matches!(result, Ok(Ok(())));
                let _ = events.send(ChildEvent::Exited { crashed }).await;
                return;
            }
            msg = control.recv() => match msg {
                Ok(m) => {
                    debug!(%lobby, msg = ?m, "control message from task");
                    let _ = events.send(ChildEvent::Control(m)).await;
                }
                Err(e) => {
                    warn!(%lobby, error = %e, "control channel failure");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(ChildCommand::Attach(session)) => {
                    let _ = control.send(&ControlMsg::Attach { session }).await;
                }
                Some(ChildCommand::Detach(session)) => {
                    let _ = control.send(&ControlMsg::Detach { session }).await;
                }
                Some(ChildCommand::Terminate) | None => {
                    let _ = control.send(&ControlMsg::Shutdown).await;
                    tokio::select! {
                        _ = &mut handle => {}
                        _ = time::sleep(Duration::from_secs(1)) => handle.abort(),
                    }
                    let _ = events.send(ChildEvent::Exited { crashed: false }).await;
                    return;
                }
            },
        }
    }
}

/// Test config: ephemeral broker port, small fast lobbies.
pub fn test_config() -> GameConfig {
    GameConfig {
        tcp_addr: "127.0.0.1:0".to_string(),
        tick_hz: 30,
        max_lobby_players: 2,
        min_players_to_start: 1,
        // Long enough that TCP-only phases of a test never trip the UDP
        // silence eviction (covered by its own test).
        client_timeout_secs: 30.0,
        ..GameConfig::default()
    }
}

/// Spawns a broker wired to a [`LocalLauncher`] and returns its address.
pub async fn start_broker(cfg: GameConfig, mode: LaunchMode) -> anyhow::Result<SocketAddr> {
    let launcher = Arc::new(LocalLauncher::new(cfg.clone(), mode));
    let broker = Broker::bind(cfg, launcher).await?;
    let addr = broker.local_addr()?;
    tokio::spawn(broker.run());
    Ok(addr)
}
