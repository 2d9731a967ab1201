//! Process supervision for per-lobby simulation servers.
//!
//! The broker talks to children through the [`Launcher`] seam so tests can
//! supervise an in-process simulation task exactly the way production
//! supervises a child process. The production impl spawns the `blitz-sim`
//! binary, waits for its ready report on the control channel, and monitors
//! it until exit.
//!
//! Only control messages cross the channel; gameplay traffic goes directly
//! client↔child over UDP.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use blitz_shared::{
    config::GameConfig,
    ipc::{ControlChannel, ControlMsg},
    lobby::{LobbyCode, SessionId},
};

/// A lobby process could not be brought up.
#[derive(Debug)]
pub enum SpawnError {
    /// The process could not be created or died before reporting ready.
    Spawn(String),
    /// The child never reported ready within the spawn timeout.
    Timeout,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Spawn(e) => write!(f, "failed to spawn lobby process: {e}"),
            SpawnError::Timeout => write!(f, "lobby process never reported ready"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Supervisor-side liveness state of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Running,
    Stopped,
    Crashed,
}

/// Events surfaced to the broker for one child.
#[derive(Debug)]
pub enum ChildEvent {
    /// A control message relayed from the child.
    Control(ControlMsg),
    /// The child exited; `crashed` when the exit was not requested.
    Exited { crashed: bool },
}

/// Commands the broker sends toward one child.
#[derive(Debug)]
pub enum ChildCommand {
    Attach(SessionId),
    Detach(SessionId),
    /// Graceful shutdown with a hard-kill fallback after the grace timeout.
    Terminate,
}

/// Handle to a supervised lobby simulation.
pub struct LobbyChild {
    pub lobby: LobbyCode,
    pub udp_port: u16,
    pub events: mpsc::Receiver<ChildEvent>,
    pub commands: mpsc::Sender<ChildCommand>,
}

/// Seam between the broker and whatever runs the simulation.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, lobby: LobbyCode) -> Result<LobbyChild, SpawnError>;
}

/// Spawns and monitors one `blitz-sim` process per lobby.
pub struct ProcessSupervisor {
    sim_binary: PathBuf,
    tick_hz: u32,
    spawn_timeout: Duration,
    shutdown_grace: Duration,
    states: Arc<Mutex<HashMap<LobbyCode, ChildState>>>,
}

impl ProcessSupervisor {
    pub fn new(cfg: &GameConfig) -> Self {
        let sim_binary = match &cfg.sim_binary {
            Some(path) => PathBuf::from(path),
            None => default_sim_binary(),
        };
        Self {
            sim_binary,
            tick_hz: cfg.tick_hz,
            spawn_timeout: Duration::from_secs(cfg.spawn_timeout_secs),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current liveness state of a lobby's child, if one was launched.
    pub fn state(&self, lobby: LobbyCode) -> Option<ChildState> {
        self.states.lock().ok()?.get(&lobby).copied()
    }

    fn set_state(states: &Arc<Mutex<HashMap<LobbyCode, ChildState>>>, lobby: LobbyCode, state: ChildState) {
        if let Ok(mut map) = states.lock() {
            map.insert(lobby, state);
        }
    }
}

/// The sim binary ships next to the broker executable.
fn default_sim_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("blitz-sim")))
        .unwrap_or_else(|| PathBuf::from("blitz-sim"))
}

#[async_trait]
impl Launcher for ProcessSupervisor {
    async fn launch(&self, lobby: LobbyCode) -> Result<LobbyChild, SpawnError> {
        let mut control = ControlChannel::bind_local()
            .await
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;
        let control_port = control
            .local_port()
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        Self::set_state(&self.states, lobby, ChildState::Starting);
        let mut child = Command::new(&self.sim_binary)
            .arg("--lobby")
            .arg(lobby.to_string())
            .arg("--control-port")
            .arg(control_port.to_string())
            .arg("--tick-hz")
            .arg(self.tick_hz.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Self::set_state(&self.states, lobby, ChildState::Crashed);
                SpawnError::Spawn(e.to_string())
            })?;

        info!(%lobby, pid = ?child.id(), binary = %self.sim_binary.display(), "spawned lobby process");

        // Block only until the child reports "ready with port N".
        let udp_port = tokio::select! {
            msg = control.recv() => match msg {
                Ok(ControlMsg::Ready { udp_port }) => udp_port,
                Ok(other) => {
                    let _ = child.kill().await;
                    Self::set_state(&self.states, lobby, ChildState::Crashed);
                    return Err(SpawnError::Spawn(format!("expected ready, got {other:?}")));
                }
                Err(e) => {
                    let _ = child.kill().await;
                    Self::set_state(&self.states, lobby, ChildState::Crashed);
                    return Err(SpawnError::Spawn(e.to_string()));
                }
            },
            status = child.wait() => {
                Self::set_state(&self.states, lobby, ChildState::Crashed);
                return Err(SpawnError::Spawn(format!("child exited before ready: {status:?}")));
            }
            _ = time::sleep(self.spawn_timeout) => {
                let _ = child.kill().await;
                Self::set_state(&self.states, lobby, ChildState::Crashed);
                return Err(SpawnError::Timeout);
            }
        };

        Self::set_state(&self.states, lobby, ChildState::Running);
        info!(%lobby, udp_port, "lobby process ready");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (evt_tx, evt_rx) = mpsc::channel(64);
        tokio::spawn(monitor(
            lobby,
            child,
            control,
            cmd_rx,
            evt_tx,
            Arc::clone(&self.states),
            self.shutdown_grace,
        ));

        Ok(LobbyChild {
            lobby,
            udp_port,
            events: evt_rx,
            commands: cmd_tx,
        })
    }
}

/// Per-child monitor: relays control messages, forwards commands, observes
/// liveness. An exit without a prior terminate request is a crash.
async fn monitor(
    lobby: LobbyCode,
    mut child: Child,
    mut control: ControlChannel,
    mut commands: mpsc::Receiver<ChildCommand>,
    events: mpsc::Sender<ChildEvent>,
    states: Arc<Mutex<HashMap<LobbyCode, ChildState>>>,
    grace: Duration,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                let clean = status.as_ref().is_ok_and(|s| s.success());
                let state = if clean { ChildState::Stopped } else { ChildState::Crashed };
                ProcessSupervisor::set_state(&states, lobby, state);
                if !clean {
                    warn!(%lobby, ?status, "lobby process exited unexpectedly");
                }
                let _ = events.send(ChildEvent::Exited { crashed: !clean }).await;
                return;
            }
            msg = control.recv() => match msg {
                Ok(m) => {
                    debug!(%lobby, msg = ?m, "control message from child");
                    if events.send(ChildEvent::Control(m)).await.is_err() {
                        // Broker dropped the handle; fall through to terminate.
                        terminate(lobby, &mut child, &control, &states, grace).await;
                        let _ = events.send(ChildEvent::Exited { crashed: false }).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(%lobby, error = %e, "control channel failure");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(ChildCommand::Attach(session)) => {
                    if let Err(e) = control.send(&ControlMsg::Attach { session }).await {
                        warn!(%lobby, %session, error = %e, "attach relay failed");
                    }
                }
                Some(ChildCommand::Detach(session)) => {
                    if let Err(e) = control.send(&ControlMsg::Detach { session }).await {
                        warn!(%lobby, %session, error = %e, "detach relay failed");
                    }
                }
                // A dropped sender means the broker discarded the lobby.
                Some(ChildCommand::Terminate) | None => {
                    terminate(lobby, &mut child, &control, &states, grace).await;
                    let _ = events.send(ChildEvent::Exited { crashed: false }).await;
                    return;
                }
            },
        }
    }
}

/// Graceful shutdown: request a drain over the channel, hard-kill after the
/// grace timeout.
async fn terminate(
    lobby: LobbyCode,
    child: &mut Child,
    control: &ControlChannel,
    states: &Arc<Mutex<HashMap<LobbyCode, ChildState>>>,
    grace: Duration,
) {
    info!(%lobby, "terminating lobby process");
    if let Err(e) = control.send(&ControlMsg::Shutdown).await {
        debug!(%lobby, error = %e, "shutdown request failed, killing");
    }
    tokio::select! {
        _ = child.wait() => {}
        _ = time::sleep(grace) => {
            warn!(%lobby, "grace expired, killing lobby process");
            let _ = child.kill().await;
        }
    }
    ProcessSupervisor::set_state(states, lobby, ChildState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cfg = GameConfig {
            sim_binary: Some("/nonexistent/blitz-sim".to_string()),
            ..GameConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&cfg);
        let lobby = LobbyCode::PUBLIC;

        match supervisor.launch(lobby).await {
            Err(SpawnError::Spawn(_)) => {}
            Err(other) => panic!("expected spawn error, got {other}"),
            Ok(_) => panic!("expected spawn error, got a running child"),
        }
        assert_eq!(supervisor.state(lobby), Some(ChildState::Crashed));
    }
}
