//! UDP transport loop for one lobby's simulation.
//!
//! The loop is single-threaded and strictly ordered per tick: drain control
//! messages, drain pending datagrams, evict silent clients, advance the
//! simulation, then broadcast the snapshot. Nothing blocks the tick beyond
//! the nonblocking receive drain.
//!
//! Untrusted senders are never acknowledged: a datagram only reaches the
//! world if its source address was bound by a HELLO_UDP for an attached
//! session.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use blitz_shared::{
    config::GameConfig,
    ecs::EntityId,
    input::Buttons,
    ipc::{ControlChannel, ControlMsg},
    lobby::{LobbyCode, SessionId},
    net::udp_send,
    packet::{DecodeError, Packet},
};

use crate::world::{GameWorld, WorldEvent};

const UDP_BUFFER_SIZE: usize = 64 * 1024;
const MAX_INPUTS_PER_SEC: u32 = 30;
const MAX_SHOTS_PER_SEC: u32 = 10;

/// Sliding one-second budget for a packet class.
struct RateLimiter {
    max_per_sec: u32,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(max_per_sec: u32, now: Instant) -> Self {
        Self {
            max_per_sec,
            window_start: now,
            count: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < self.max_per_sec {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Roster entry for one attached session.
struct Remote {
    entity: Option<EntityId>,
    addr: Option<SocketAddr>,
    last_seen: Instant,
    inputs: RateLimiter,
    shots: RateLimiter,
}

/// One lobby's real-time server: game world plus its UDP socket.
pub struct UdpGameServer {
    socket: UdpSocket,
    world: GameWorld,
    control: Option<ControlChannel>,
    lobby: LobbyCode,

    remotes: HashMap<SessionId, Remote>,
    by_addr: HashMap<SocketAddr, SessionId>,
    /// Datagrams received between ticks, applied at the next drain.
    pending: Vec<(Packet, SocketAddr)>,

    tick_dt: f32,
    client_timeout: Duration,
    shutdown: bool,
}

impl UdpGameServer {
    /// Binds the game socket (port 0 picks an ephemeral port) and returns
    /// the server with its actual port.
    pub async fn bind(
        lobby: LobbyCode,
        udp_port: u16,
        cfg: &GameConfig,
        control: Option<ControlChannel>,
        seed: u64,
    ) -> anyhow::Result<(Self, u16)> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), udp_port);
        let socket = UdpSocket::bind(bind).await.context("game socket bind")?;
        let port = socket.local_addr().context("game socket local_addr")?.port();
        info!(%lobby, port, "simulation listening");

        Ok((
            Self {
                socket,
                world: GameWorld::new(seed, cfg.max_lobby_players),
                control,
                lobby,
                remotes: HashMap::new(),
                by_addr: HashMap::new(),
                pending: Vec::new(),
                tick_dt: cfg.tick_dt(),
                client_timeout: Duration::from_secs_f32(cfg.client_timeout_secs),
                shutdown: false,
            },
            port,
        ))
    }

    pub fn world(&self) -> &GameWorld {
        &self.world
    }

    /// Admits a session to the roster; only attached sessions may HELLO_UDP.
    pub fn attach(&mut self, session: SessionId) {
        let now = Instant::now();
        self.remotes.entry(session).or_insert_with(|| Remote {
            entity: None,
            addr: None,
            last_seen: now,
            inputs: RateLimiter::new(MAX_INPUTS_PER_SEC, now),
            shots: RateLimiter::new(MAX_SHOTS_PER_SEC, now),
        });
        debug!(%session, "session attached");
    }

    /// Revokes a session: its player leaves the world and the address
    /// mapping is dropped.
    pub fn detach(&mut self, session: SessionId) {
        let Some(remote) = self.remotes.remove(&session) else {
            return;
        };
        if let Some(addr) = remote.addr {
            self.by_addr.remove(&addr);
        }
        if let Some(entity) = remote.entity {
            if let Err(e) = self.world.remove_player(entity) {
                debug!(%session, error = %e, "detached session had no live player");
            }
        }
        debug!(%session, "session detached");
    }

    /// Runs ticks at the fixed rate until shutdown or the post-game drain.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Some(control) = &self.control {
            let port = self.socket.local_addr().context("local_addr")?.port();
            control
                .send(&ControlMsg::Ready { udp_port: port })
                .await
                .context("report ready")?;
        }

        let dt = Duration::from_secs_f32(self.tick_dt);
        let mut next = Instant::now() + dt;
        loop {
            self.step(self.tick_dt).await?;
            if self.shutdown {
                info!(lobby = %self.lobby, "simulation shut down");
                return Ok(());
            }
            self.idle_until(next).await?;
            next += dt;
        }
    }

    /// Runs a bounded number of ticks (test helper).
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.tick_dt);
        let mut next = Instant::now() + dt;
        for _ in 0..ticks {
            self.step(self.tick_dt).await?;
            if self.shutdown {
                break;
            }
            self.idle_until(next).await?;
            next += dt;
        }
        Ok(())
    }

    /// Waits out the rest of the tick interval while still servicing the
    /// socket: latency probes are answered on the spot, everything else is
    /// queued for the next drain.
    async fn idle_until(&mut self, deadline: Instant) -> anyhow::Result<()> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return Ok(()),
                ready = self.socket.readable() => {
                    ready.context("udp readable")?;
                    loop {
                        match self.socket.try_recv_from(&mut buf) {
                            Ok((n, from)) => match Packet::decode(&buf[..n]) {
                                Ok(Packet::PingUdp { token }) => {
                                    if self.by_addr.contains_key(&from) {
                                        let pong = Packet::PongUdp { token };
                                        if let Err(e) = udp_send(&self.socket, &pong, from).await {
                                            debug!(%from, error = %e, "pong send failed");
                                        }
                                    }
                                }
                                Ok(packet) => self.pending.push((packet, from)),
                                Err(e) => debug!(%from, error = %e, "dropping malformed datagram"),
                            },
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                warn!(error = %e, "udp receive error");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Executes one fixed step: control drain, packet drain, eviction,
    /// simulation, event fan-out, snapshot broadcast.
    pub async fn step(&mut self, dt: f32) -> anyhow::Result<()> {
        self.drain_control().await?;
        if self.shutdown {
            // No partial tick once shutdown begins.
            self.world.close();
            return Ok(());
        }
        self.drain_sockets().await?;
        self.evict_silent().await;
        self.world.tick(dt);
        self.forward_events().await;
        self.broadcast_snapshot().await;
        Ok(())
    }

    async fn drain_control(&mut self) -> anyhow::Result<()> {
        let Some(control) = &mut self.control else {
            return Ok(());
        };
        let mut pending = Vec::new();
        while let Some(msg) = control.try_recv()? {
            pending.push(msg);
        }
        for msg in pending {
            match msg {
                ControlMsg::Attach { session } => self.attach(session),
                ControlMsg::Detach { session } => self.detach(session),
                ControlMsg::Shutdown => {
                    info!(lobby = %self.lobby, "shutdown requested");
                    self.shutdown = true;
                }
                other => debug!(?other, "ignoring unexpected control message"),
            }
        }
        Ok(())
    }

    async fn drain_sockets(&mut self) -> anyhow::Result<()> {
        for (packet, from) in std::mem::take(&mut self.pending) {
            self.handle_packet(packet, from).await;
        }
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => match Packet::decode(&buf[..n]) {
                    Ok(packet) => self.handle_packet(packet, from).await,
                    Err(DecodeError::BadMagic) => {
                        debug!(%from, "dropping datagram with bad magic")
                    }
                    Err(e) => debug!(%from, error = %e, "dropping malformed datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                // Transient receive errors retry next tick.
                Err(e) => {
                    warn!(error = %e, "udp receive error");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::HelloUdp { session } => self.handle_hello(session, from).await,
            Packet::Input { session, buttons } => self.handle_input(session, buttons, from),
            Packet::Shoot { session } => self.handle_shoot(session, from),
            Packet::PingUdp { token } => {
                // Latency probe, answered immediately, mapped senders only.
                if self.by_addr.contains_key(&from) {
                    if let Err(e) = udp_send(&self.socket, &Packet::PongUdp { token }, from).await {
                        debug!(%from, error = %e, "pong send failed");
                    }
                }
            }
            other => debug!(?other, %from, "unexpected gameplay packet"),
        }
    }

    async fn handle_hello(&mut self, session: SessionId, from: SocketAddr) {
        let Some(remote) = self.remotes.get_mut(&session) else {
            // Unknown senders are dropped without a response.
            debug!(%session, %from, "hello from unattached session");
            return;
        };

        if remote.entity.is_none() {
            match self.world.register_player(session) {
                Ok(entity) => remote.entity = Some(entity),
                Err(e) => {
                    warn!(%session, error = %e, "cannot register player");
                    return;
                }
            }
        }
        if let Some(old) = remote.addr.replace(from) {
            self.by_addr.remove(&old);
        }
        remote.last_seen = Instant::now();
        self.by_addr.insert(from, session);

        // Fresh snapshot right away so the client sees the lobby without
        // waiting for the next tick.
        let snap = self.world.build_snapshot_packet();
        if let Err(e) = udp_send(&self.socket, &snap, from).await {
            debug!(%from, error = %e, "hello snapshot send failed");
        }
        info!(%session, %from, "client registered over udp");
    }

    /// Validates the sender address against the roster and returns the
    /// session's player entity.
    fn mapped_entity(&mut self, session: SessionId, from: SocketAddr) -> Option<EntityId> {
        let mapped = *self.by_addr.get(&from)?;
        if mapped != session {
            debug!(%session, %from, "session id does not match sender address");
            return None;
        }
        let remote = self.remotes.get_mut(&session)?;
        remote.last_seen = Instant::now();
        remote.entity
    }

    fn handle_input(&mut self, session: SessionId, buttons: Buttons, from: SocketAddr) {
        let Some(entity) = self.mapped_entity(session, from) else {
            return;
        };
        let now = Instant::now();
        let allowed = self
            .remotes
            .get_mut(&session)
            .is_some_and(|r| r.inputs.allow(now));
        if !allowed {
            debug!(%session, "input rate limited");
            return;
        }
        if let Err(e) = self.world.update_input(entity, buttons) {
            warn!(%session, error = %e, "input for invalid entity");
        }
    }

    fn handle_shoot(&mut self, session: SessionId, from: SocketAddr) {
        let Some(entity) = self.mapped_entity(session, from) else {
            return;
        };
        let now = Instant::now();
        let allowed = self
            .remotes
            .get_mut(&session)
            .is_some_and(|r| r.shots.allow(now));
        if !allowed {
            debug!(%session, "shoot rate limited");
            return;
        }
        if let Err(e) = self.world.add_shot(entity) {
            warn!(%session, error = %e, "shot for invalid entity");
        }
    }

    async fn evict_silent(&mut self) {
        let now = Instant::now();
        let timeout = self.client_timeout;
        let silent: Vec<SessionId> = self
            .remotes
            .iter()
            .filter(|(_, r)| r.addr.is_some() && now.duration_since(r.last_seen) > timeout)
            .map(|(s, _)| *s)
            .collect();

        for session in silent {
            warn!(%session, "client timed out");
            if let Some(remote) = self.remotes.get_mut(&session) {
                if let Some(addr) = remote.addr.take() {
                    self.by_addr.remove(&addr);
                }
                if let Some(entity) = remote.entity.take() {
                    if let Err(e) = self.world.remove_player(entity) {
                        debug!(%session, error = %e, "timed-out session had no live player");
                    }
                }
            }
            self.notify(ControlMsg::Dropped { session }).await;
        }
    }

    async fn forward_events(&mut self) {
        for event in self.world.take_events() {
            match event {
                WorldEvent::LevelUp {
                    session,
                    level,
                    score,
                } => {
                    let packet = Packet::Leveling {
                        session,
                        level,
                        score,
                    };
                    self.broadcast(&packet).await;
                }
                WorldEvent::PlayerDied { session } => {
                    if let Some(remote) = self.remotes.get_mut(&session) {
                        remote.entity = None;
                    }
                    self.notify(ControlMsg::PlayerDied { session }).await;
                }
            }
        }

        if self.world.take_boss_spawned() {
            self.notify(ControlMsg::BossSpawned).await;
        }
        if self.world.take_boss_defeated() {
            self.notify(ControlMsg::BossDefeated).await;
        }
        if self.world.take_no_players() {
            info!(lobby = %self.lobby, "no players remaining, draining");
            self.notify(ControlMsg::NoPlayers).await;
            self.shutdown = true;
        }
    }

    async fn broadcast_snapshot(&mut self) {
        let snap = self.world.build_snapshot_packet();
        self.broadcast(&snap).await;
    }

    /// Best-effort send to every mapped address; one failure never aborts
    /// the rest of the broadcast.
    async fn broadcast(&self, packet: &Packet) {
        for remote in self.remotes.values() {
            let Some(addr) = remote.addr else { continue };
            if let Err(e) = udp_send(&self.socket, packet, addr).await {
                debug!(%addr, error = %e, "broadcast send failed");
            }
        }
    }

    async fn notify(&mut self, msg: ControlMsg) {
        if let Some(control) = &self.control {
            if let Err(e) = control.send(&msg).await {
                warn!(error = %e, "control notify failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blitz_shared::net::udp_recv_timeout;

    fn test_cfg() -> GameConfig {
        GameConfig {
            tick_hz: 60,
            client_timeout_secs: 0.2,
            ..GameConfig::default()
        }
    }

    async fn bind_test_server() -> anyhow::Result<(UdpGameServer, SocketAddr)> {
        let (server, port) =
            UdpGameServer::bind(LobbyCode::PUBLIC, 0, &test_cfg(), None, 7).await?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Ok((server, addr))
    }

    #[tokio::test]
    async fn unattached_hello_is_dropped_silently() -> anyhow::Result<()> {
        let (mut server, addr) = bind_test_server().await?;
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        udp_send(
            &client,
            &Packet::HelloUdp {
                session: SessionId(9),
            },
            addr,
        )
        .await?;
        server.step(1.0 / 60.0).await?;

        let got = udp_recv_timeout(&client, Duration::from_millis(100)).await?;
        assert!(got.is_none(), "untrusted sender must not be acknowledged");
        assert_eq!(server.world().player_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn attached_hello_registers_and_snapshots_immediately() -> anyhow::Result<()> {
        let (mut server, addr) = bind_test_server().await?;
        server.attach(SessionId(1));
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        udp_send(
            &client,
            &Packet::HelloUdp {
                session: SessionId(1),
            },
            addr,
        )
        .await?;
        server.step(1.0 / 60.0).await?;

        let (packet, _) = udp_recv_timeout(&client, Duration::from_millis(200))
            .await?
            .expect("immediate snapshot");
        match packet {
            Packet::Snapshot(s) => assert_eq!(s.players.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn ping_udp_echoes_token_for_mapped_sender() -> anyhow::Result<()> {
        let (mut server, addr) = bind_test_server().await?;
        server.attach(SessionId(1));
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        udp_send(
            &client,
            &Packet::HelloUdp {
                session: SessionId(1),
            },
            addr,
        )
        .await?;
        server.step(1.0 / 60.0).await?;
        // Drain the hello snapshot and the tick snapshot.
        while udp_recv_timeout(&client, Duration::from_millis(50))
            .await?
            .is_some()
        {}

        udp_send(&client, &Packet::PingUdp { token: 0xABCD }, addr).await?;
        server.step(1.0 / 60.0).await?;

        let mut pong = None;
        while let Some((packet, _)) = udp_recv_timeout(&client, Duration::from_millis(100)).await? {
            if let Packet::PongUdp { token } = packet {
                pong = Some(token);
                break;
            }
        }
        assert_eq!(pong, Some(0xABCD));
        Ok(())
    }

    #[tokio::test]
    async fn silent_client_is_evicted() -> anyhow::Result<()> {
        let (mut server, addr) = bind_test_server().await?;
        server.attach(SessionId(1));
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        udp_send(
            &client,
            &Packet::HelloUdp {
                session: SessionId(1),
            },
            addr,
        )
        .await?;
        server.step(1.0 / 60.0).await?;
        assert_eq!(server.world().player_count(), 1);

        time::sleep(Duration::from_millis(300)).await;
        server.step(1.0 / 60.0).await?;
        assert_eq!(server.world().player_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn input_floods_are_rate_limited() -> anyhow::Result<()> {
        let (mut server, addr) = bind_test_server().await?;
        server.attach(SessionId(1));
        let client = UdpSocket::bind("127.0.0.1:0").await?;

        udp_send(
            &client,
            &Packet::HelloUdp {
                session: SessionId(1),
            },
            addr,
        )
        .await?;
        server.step(1.0 / 60.0).await?;

        for _ in 0..(MAX_INPUTS_PER_SEC + 20) {
            udp_send(
                &client,
                &Packet::Input {
                    session: SessionId(1),
                    buttons: Buttons::RIGHT,
                },
                addr,
            )
            .await?;
        }
        // Give the datagrams a moment to land, then drain them in one step.
        time::sleep(Duration::from_millis(50)).await;
        server.step(1.0 / 60.0).await?;

        let session = SessionId(1);
        let counted = server.remotes.get(&session).map(|r| r.inputs.count);
        assert_eq!(counted, Some(MAX_INPUTS_PER_SEC));
        Ok(())
    }
}
