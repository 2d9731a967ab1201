//! TCP lobby broker.
//!
//! One task per connection; every session/lobby mutation goes through a
//! single mutex-protected state domain, since concurrent connections can
//! race joins into the same lobby.
//!
//! Per-connection flow: Connecting → Authenticated (hello exchange) →
//! InLobby → Delegated (UDP endpoint handed out) → Closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use blitz_shared::{
    config::GameConfig,
    ipc::ControlMsg,
    lobby::{LobbyCode, LobbyError, SessionId, SessionManager},
    net::{Acceptor, PacketReader, PacketWriter, TcpConn},
    packet::{LobbyDenyReason, Packet, RefuseReason, RosterEntry, PROTOCOL_VERSION},
};

use crate::supervisor::{ChildCommand, ChildEvent, Launcher};

const MAX_SESSIONS: usize = 64;
const MAX_NAME_LEN: usize = 12;
const MAX_CHAT_LEN: usize = 120;

enum Outgoing {
    Packet(Packet),
    Close,
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    /// Forces the connection's read loop to exit (crash eviction).
    notify: Arc<Notify>,
}

struct ChildHandle {
    commands: mpsc::Sender<ChildCommand>,
    udp_port: u16,
}

/// The single mutual-exclusion domain for session/lobby/child tables.
struct BrokerState {
    sessions: SessionManager,
    conns: HashMap<SessionId, ConnHandle>,
    children: HashMap<LobbyCode, ChildHandle>,
}

impl BrokerState {
    fn send_to(&self, session: SessionId, packet: Packet) {
        if let Some(conn) = self.conns.get(&session) {
            let _ = conn.tx.send(Outgoing::Packet(packet));
        }
    }

    /// Queues a close and kicks the reader loop awake.
    fn disconnect(&self, session: SessionId) {
        if let Some(conn) = self.conns.get(&session) {
            let _ = conn.tx.send(Outgoing::Close);
            conn.notify.notify_one();
        }
    }

    fn broadcast_lobby(&self, code: LobbyCode, packet: Packet, except: Option<SessionId>) {
        for member in self.sessions.members(code) {
            if Some(member) == except {
                continue;
            }
            self.send_to(member, packet.clone());
        }
    }

    fn broadcast_all(&self, packet: Packet) {
        for conn in self.conns.values() {
            let _ = conn.tx.send(Outgoing::Packet(packet.clone()));
        }
    }

    fn roster_packet(&self, code: LobbyCode) -> Packet {
        let players = self
            .sessions
            .members(code)
            .into_iter()
            .filter_map(|m| {
                self.sessions.session(m).map(|s| RosterEntry {
                    session: m,
                    name: s.name.clone(),
                })
            })
            .collect();
        Packet::PlayerList { players }
    }

    fn refresh_lobby(&self, code: LobbyCode) {
        let roster = self.roster_packet(code);
        self.broadcast_lobby(code, roster, None);
    }

    fn sys_message(&self, code: LobbyCode, text: &str) {
        self.broadcast_lobby(
            code,
            Packet::Message {
                text: format!("SYS:{text}"),
            },
            None,
        );
    }
}

/// The lobby broker: accept loop plus shared state.
pub struct Broker {
    cfg: GameConfig,
    acceptor: Acceptor,
    state: Arc<Mutex<BrokerState>>,
    launcher: Arc<dyn Launcher>,
}

impl Broker {
    pub async fn bind(cfg: GameConfig, launcher: Arc<dyn Launcher>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.tcp_addr.parse()?;
        let acceptor = Acceptor::bind(addr).await?;
        let state = Arc::new(Mutex::new(BrokerState {
            sessions: SessionManager::new(cfg.max_lobby_players, cfg.min_players_to_start),
            conns: HashMap::new(),
            children: HashMap::new(),
        }));
        Ok(Self {
            cfg,
            acceptor,
            state,
            launcher,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Accepts connections forever, one task per client.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "broker listening");
        loop {
            let (conn, peer) = self.acceptor.accept().await?;
            debug!(%peer, "connection accepted");
            let cfg = self.cfg.clone();
            let state = Arc::clone(&self.state);
            let launcher = Arc::clone(&self.launcher);
            tokio::spawn(async move {
                if let Err(e) = connection_task(conn, peer, cfg, state, launcher).await {
                    debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn connection_task(
    conn: TcpConn,
    peer: SocketAddr,
    cfg: GameConfig,
    state: Arc<Mutex<BrokerState>>,
    launcher: Arc<dyn Launcher>,
) -> anyhow::Result<()> {
    let (reader, writer) = conn.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, rx));

    let mut incoming = spawn_reader(reader);

    let _ = tx.send(Outgoing::Packet(Packet::ServerHello {
        protocol: PROTOCOL_VERSION,
    }));

    let refuse = |reason: RefuseReason| {
        let _ = tx.send(Outgoing::Packet(Packet::Refused { reason }));
        let _ = tx.send(Outgoing::Close);
    };

    // Handshake: a valid CLIENT_HELLO within the timeout, or nothing.
    let handshake = time::timeout(
        Duration::from_secs(cfg.handshake_timeout_secs),
        incoming.recv(),
    )
    .await;
    let raw_name = match handshake {
        Ok(Some(Ok(Packet::ClientHello { protocol, name }))) => {
            if protocol != PROTOCOL_VERSION {
                debug!(%peer, protocol, "protocol mismatch");
                refuse(RefuseReason::BadProtocol);
                return Ok(());
            }
            name
        }
        Ok(Some(Ok(other))) => {
            debug!(%peer, packet = ?other, "bad handshake");
            refuse(RefuseReason::BadHandshake);
            return Ok(());
        }
        Ok(_) => return Ok(()), // disconnected mid-handshake
        Err(_) => {
            debug!(%peer, "handshake timeout");
            refuse(RefuseReason::Timeout);
            return Ok(());
        }
    };

    let notify = Arc::new(Notify::new());
    let session = {
        let mut st = state.lock().await;
        if st.sessions.session_count() >= MAX_SESSIONS {
            drop(st);
            refuse(RefuseReason::ServerFull);
            return Ok(());
        }
        let session = st.sessions.create_session(String::new());
        let name = match sanitize_name(&raw_name) {
            name if name.is_empty() => format!("Player{session}"),
            name => name,
        };
        st.sessions.set_name(session, name);
        st.conns.insert(
            session,
            ConnHandle {
                tx: tx.clone(),
                notify: Arc::clone(&notify),
            },
        );
        session
    };
    let _ = tx.send(Outgoing::Packet(Packet::Ok { session }));
    info!(%session, %peer, "handshake done, awaiting lobby selection");

    let mut ping = time::interval_at(
        Instant::now() + Duration::from_secs(cfg.ping_interval_secs),
        Duration::from_secs(cfg.ping_interval_secs),
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let pong_timeout = Duration::from_secs(cfg.pong_timeout_secs);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = notify.notified() => {
                debug!(%session, "forcibly disconnected");
                break;
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    info!(%session, "client timed out (no pong)");
                    break;
                }
                let _ = tx.send(Outgoing::Packet(Packet::Ping));
            }
            packet = incoming.recv() => match packet {
                Some(Ok(Packet::Pong)) => last_pong = Instant::now(),
                Some(Ok(Packet::Ping)) => {
                    let _ = tx.send(Outgoing::Packet(Packet::Pong));
                }
                Some(Ok(Packet::CreateLobby)) => {
                    handle_create(session, &state, &launcher).await;
                }
                Some(Ok(Packet::JoinLobby { code })) => {
                    handle_join(session, code, &state, &launcher).await;
                }
                Some(Ok(Packet::Message { text })) => {
                    handle_message(session, &text, &state).await;
                }
                Some(Ok(other)) => debug!(%session, packet = ?other, "unexpected packet"),
                Some(Err(_)) | None => {
                    info!(%session, "client disconnected");
                    break;
                }
            }
        }
    }

    disconnect_cleanup(session, &state).await;
    Ok(())
}

/// Pipes framed packets into a channel so the select loop never cancels a
/// partial frame read.
fn spawn_reader(mut reader: PacketReader) -> mpsc::Receiver<anyhow::Result<Packet>> {
    let (in_tx, in_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(packet) => {
                    if in_tx.send(Ok(packet)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = in_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    in_rx
}

async fn write_loop(mut writer: PacketWriter, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Packet(packet) => {
                if writer.send(&packet).await.is_err() {
                    return;
                }
            }
            Outgoing::Close => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

async fn handle_create(
    session: SessionId,
    state: &Arc<Mutex<BrokerState>>,
    launcher: &Arc<dyn Launcher>,
) {
    let mut st = state.lock().await;
    let old = st.sessions.session(session).and_then(|s| s.lobby);
    match st.sessions.create_lobby(session) {
        Ok(code) => {
            info!(%session, %code, "lobby created");
            leave_old_lobby(&mut st, session, old).await;
            let _ = finalize_join(&mut st, state, session, code, launcher).await;
        }
        Err(e) => {
            debug!(%session, error = %e, "create refused");
            st.send_to(
                session,
                Packet::LobbyError {
                    reason: deny_reason(e),
                },
            );
        }
    }
}

async fn handle_join(
    session: SessionId,
    code: LobbyCode,
    state: &Arc<Mutex<BrokerState>>,
    launcher: &Arc<dyn Launcher>,
) {
    let mut st = state.lock().await;
    let old = st.sessions.session(session).and_then(|s| s.lobby);
    match st.sessions.join_lobby(session, code) {
        Ok(()) => {
            info!(%session, %code, "joined lobby");
            leave_old_lobby(&mut st, session, old.filter(|c| *c != code)).await;
            let _ = finalize_join(&mut st, state, session, code, launcher).await;
        }
        Err(e) => {
            debug!(%session, %code, error = %e, "join refused");
            st.send_to(
                session,
                Packet::LobbyError {
                    reason: deny_reason(e),
                },
            );
        }
    }
}

/// A lobby switch implicitly left the previous lobby: detach the session
/// from that lobby's child and refresh its roster.
async fn leave_old_lobby(st: &mut BrokerState, session: SessionId, old: Option<LobbyCode>) {
    let Some(old_code) = old else { return };
    if st.sessions.lobby(old_code).is_none() {
        // The switch emptied the old lobby; its process goes with it.
        if let Some(child) = st.children.remove(&old_code) {
            let _ = child.commands.send(ChildCommand::Terminate).await;
        }
        return;
    }
    if let Some(child) = st.children.get(&old_code) {
        let _ = child.commands.send(ChildCommand::Detach(session)).await;
    }
    st.refresh_lobby(old_code);
}

/// Shared tail of create/join: delegate when the membership minimum is
/// first reached, acknowledge with the endpoint, broadcast the roster.
async fn finalize_join(
    st: &mut BrokerState,
    state: &Arc<Mutex<BrokerState>>,
    session: SessionId,
    code: LobbyCode,
    launcher: &Arc<dyn Launcher>,
) -> Result<(), ()> {
    if let Some(child) = st.children.get(&code) {
        // Late joiner into an already-delegated lobby.
        let _ = child.commands.send(ChildCommand::Attach(session)).await;
    } else if st.sessions.should_delegate(code) {
        match launcher.launch(code).await {
            Ok(child) => {
                st.sessions.mark_delegated(code, child.udp_port);
                for member in st.sessions.members(code) {
                    let _ = child.commands.send(ChildCommand::Attach(member)).await;
                }
                tokio::spawn(pump_child_events(code, child.events, Arc::clone(state)));
                let udp_port = child.udp_port;
                st.children.insert(
                    code,
                    ChildHandle {
                        commands: child.commands,
                        udp_port,
                    },
                );
                info!(%code, udp_port, "lobby delegated");
                // Relay the endpoint to members that were waiting on it.
                for member in st.sessions.members(code) {
                    if member != session {
                        st.send_to(member, Packet::LobbyOk { code, udp_port });
                    }
                }
            }
            Err(e) => {
                warn!(%code, error = %e, "delegation failed");
                st.sessions.leave_lobby(session);
                st.send_to(
                    session,
                    Packet::LobbyError {
                        reason: LobbyDenyReason::SpawnFailed,
                    },
                );
                st.refresh_lobby(code);
                return Err(());
            }
        }
    }

    let udp_port = st
        .sessions
        .lobby(code)
        .and_then(|l| l.udp_port)
        .unwrap_or(0);
    st.send_to(session, Packet::LobbyOk { code, udp_port });

    let entry = RosterEntry {
        session,
        name: st
            .sessions
            .session(session)
            .map(|s| s.name.clone())
            .unwrap_or_default(),
    };
    st.broadcast_lobby(code, Packet::NewPlayer { entry }, Some(session));
    st.refresh_lobby(code);
    Ok(())
}

async fn handle_message(session: SessionId, text: &str, state: &Arc<Mutex<BrokerState>>) {
    let st = state.lock().await;
    let Some(sender) = st.sessions.session(session) else {
        return;
    };
    let clean = sanitize_chat(text);
    if clean.is_empty() {
        return;
    }
    let message = Packet::Message {
        text: format!("CHAT:{}: {}", sender.name, clean),
    };
    match sender.lobby {
        Some(code) => st.broadcast_lobby(code, message, None),
        // Not in a lobby yet: the message goes to everyone connected.
        None => st.broadcast_all(message),
    }
}

async fn disconnect_cleanup(session: SessionId, state: &Arc<Mutex<BrokerState>>) {
    let mut st = state.lock().await;
    st.conns.remove(&session);
    let (removed, left) = st.sessions.remove_session(session);
    if let Some(left) = left {
        if let Some(child) = st.children.get(&left.code) {
            let _ = child.commands.send(ChildCommand::Detach(session)).await;
        }
        let name = removed.map(|s| s.name).unwrap_or_default();
        st.sys_message(left.code, &format!("{name} disconnected"));
        st.refresh_lobby(left.code);
        if left.now_empty {
            if let Some(child) = st.children.remove(&left.code) {
                let _ = child.commands.send(ChildCommand::Terminate).await;
            }
        }
    }
    info!(%session, "session closed");
}

/// Forwards one child's events into broker state until it exits.
async fn pump_child_events(
    code: LobbyCode,
    mut events: mpsc::Receiver<ChildEvent>,
    state: Arc<Mutex<BrokerState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChildEvent::Control(msg) => handle_child_control(code, msg, &state).await,
            ChildEvent::Exited { crashed } => {
                let mut st = state.lock().await;
                st.children.remove(&code);
                let members = st.sessions.remove_lobby(code);
                if crashed {
                    warn!(%code, "lobby process crashed, evicting members");
                    for member in members {
                        st.send_to(
                            member,
                            Packet::LobbyError {
                                reason: LobbyDenyReason::Crashed,
                            },
                        );
                        st.disconnect(member);
                    }
                } else if !members.is_empty() {
                    info!(%code, "lobby process stopped");
                    for member in members {
                        st.send_to(
                            member,
                            Packet::LobbyError {
                                reason: LobbyDenyReason::InvalidState,
                            },
                        );
                    }
                }
                return;
            }
        }
    }
}

async fn handle_child_control(code: LobbyCode, msg: ControlMsg, state: &Arc<Mutex<BrokerState>>) {
    match msg {
        ControlMsg::PlayerDied { session } => {
            let mut st = state.lock().await;
            let name = st
                .sessions
                .session(session)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let left = st.sessions.leave_lobby(session);
            st.send_to(
                session,
                Packet::Message {
                    text: "DEAD".to_string(),
                },
            );
            st.sys_message(code, &format!("{name} died"));
            st.refresh_lobby(code);
            if left.is_some_and(|l| l.now_empty) {
                if let Some(child) = st.children.remove(&code) {
                    let _ = child.commands.send(ChildCommand::Terminate).await;
                }
            }
        }
        ControlMsg::Dropped { session } => {
            let mut st = state.lock().await;
            let name = st
                .sessions
                .session(session)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let left = st.sessions.leave_lobby(session);
            st.sys_message(code, &format!("{name} timed out"));
            st.refresh_lobby(code);
            if left.is_some_and(|l| l.now_empty) {
                if let Some(child) = st.children.remove(&code) {
                    let _ = child.commands.send(ChildCommand::Terminate).await;
                }
            }
        }
        ControlMsg::BossSpawned => {
            state.lock().await.sys_message(code, "Boss incoming");
        }
        ControlMsg::BossDefeated => {
            state.lock().await.sys_message(code, "Boss defeated - victory");
        }
        ControlMsg::NoPlayers => {
            let mut st = state.lock().await;
            info!(%code, "lobby empty, tearing down");
            st.sessions.remove_lobby(code);
            if let Some(child) = st.children.remove(&code) {
                let _ = child.commands.send(ChildCommand::Terminate).await;
            }
        }
        other => debug!(%code, msg = ?other, "unexpected control message"),
    }
}

fn deny_reason(e: LobbyError) -> LobbyDenyReason {
    match e {
        LobbyError::NotAuthenticated => LobbyDenyReason::NotAuthenticated,
        LobbyError::LobbyFull => LobbyDenyReason::Full,
        LobbyError::LobbyNotFound => LobbyDenyReason::NotFound,
    }
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_LEN)
        .collect()
}

fn sanitize_chat(raw: &str) -> String {
    raw.chars()
        .filter(|c| (' '..='~').contains(c))
        .take(MAX_CHAT_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sanitized_and_bounded() {
        assert_eq!(sanitize_name("Ace"), "Ace");
        assert_eq!(sanitize_name("  A c/e!\n"), "Ace");
        assert_eq!(sanitize_name("x".repeat(40).as_str()), "x".repeat(12));
        assert_eq!(sanitize_name("@@@"), "");
    }

    #[test]
    fn chat_is_printable_and_bounded() {
        assert_eq!(sanitize_chat("hello\tworld\x07"), "helloworld");
        assert_eq!(sanitize_chat("a b"), "a b");
        assert_eq!(sanitize_chat("y".repeat(300).as_str()).len(), MAX_CHAT_LEN);
    }
}
