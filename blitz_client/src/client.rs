//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, lobby commands, roster, chat)
//! - An unreliable datagram socket (hello, input, shoot, snapshots)
//! - A latest-wins snapshot slot (interpolation is a rendering concern and
//!   lives outside this crate)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use blitz_shared::{
    input::Buttons,
    lobby::{LobbyCode, SessionId},
    net::{udp_recv_timeout, udp_send, TcpConn},
    packet::{Packet, RosterEntry, Snapshot, PROTOCOL_VERSION},
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lobby membership as acknowledged by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyTicket {
    pub code: LobbyCode,
    /// 0 until the lobby is delegated to a simulation process.
    pub udp_port: u16,
}

impl LobbyTicket {
    pub fn is_delegated(&self) -> bool {
        self.udp_port != 0
    }
}

/// High-level game client.
pub struct GameClient {
    pub session: SessionId,
    pub name: String,
    pub ticket: Option<LobbyTicket>,

    /// Lobby roster as last broadcast by the broker.
    pub roster: Vec<RosterEntry>,
    /// Chat and system messages in arrival order.
    pub messages: Vec<String>,
    /// Score/level notices in arrival order.
    pub levelings: Vec<(SessionId, u8, u16)>,

    conn: TcpConn,
    udp: UdpSocket,
    server_ip: IpAddr,
    latest: Option<Snapshot>,
    ping_token: u32,
}

impl GameClient {
    /// Connects and performs the hello handshake.
    pub async fn connect(server_addr: SocketAddr, name: &str) -> anyhow::Result<Self> {
        info!(server = %server_addr, "connecting");
        let mut conn = TcpConn::connect(server_addr).await?;

        let hello = time::timeout(REPLY_TIMEOUT, conn.recv())
            .await
            .context("server hello timeout")??;
        match hello {
            Packet::ServerHello { protocol } if protocol == PROTOCOL_VERSION => {}
            Packet::ServerHello { protocol } => {
                anyhow::bail!("protocol mismatch: server speaks {protocol}")
            }
            other => anyhow::bail!("expected server hello, got {other:?}"),
        }

        conn.send(&Packet::ClientHello {
            protocol: PROTOCOL_VERSION,
            name: name.to_string(),
        })
        .await?;

        let session = loop {
            let reply = time::timeout(REPLY_TIMEOUT, conn.recv())
                .await
                .context("handshake reply timeout")??;
            match reply {
                Packet::Ok { session } => break session,
                Packet::Refused { reason } => anyhow::bail!("connection refused: {reason:?}"),
                Packet::Ping => conn.send(&Packet::Pong).await?,
                other => debug!(packet = ?other, "ignoring pre-session packet"),
            }
        };
        info!(%session, "connected");

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let udp = UdpSocket::bind(bind).await.context("udp bind")?;

        Ok(Self {
            session,
            name: name.to_string(),
            ticket: None,
            roster: Vec::new(),
            messages: Vec::new(),
            levelings: Vec::new(),
            conn,
            udp,
            server_ip: server_addr.ip(),
            latest: None,
            ping_token: 1,
        })
    }

    /// Requests a fresh lobby and waits for the broker's verdict.
    pub async fn create_lobby(&mut self) -> anyhow::Result<LobbyTicket> {
        self.conn.send(&Packet::CreateLobby).await?;
        self.await_lobby_reply().await
    }

    /// Joins a lobby by code and waits for the broker's verdict.
    pub async fn join_lobby(&mut self, code: LobbyCode) -> anyhow::Result<LobbyTicket> {
        self.conn.send(&Packet::JoinLobby { code }).await?;
        self.await_lobby_reply().await
    }

    /// Sends a chat line.
    pub async fn say(&mut self, text: &str) -> anyhow::Result<()> {
        self.conn
            .send(&Packet::Message {
                text: text.to_string(),
            })
            .await
    }

    async fn await_lobby_reply(&mut self) -> anyhow::Result<LobbyTicket> {
        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            anyhow::ensure!(!remaining.is_zero(), "lobby reply timeout");
            let packet = time::timeout(remaining, self.conn.recv())
                .await
                .context("lobby reply timeout")??;
            match packet {
                Packet::LobbyOk { code, udp_port } => {
                    let ticket = LobbyTicket { code, udp_port };
                    self.ticket = Some(ticket);
                    info!(%code, udp_port, "lobby acknowledged");
                    return Ok(ticket);
                }
                Packet::LobbyError { reason } => anyhow::bail!("lobby refused: {reason:?}"),
                other => self.absorb(other).await?,
            }
        }
    }

    /// Processes at most one pending control-stream packet.
    pub async fn poll_tcp(&mut self, timeout: Duration) -> anyhow::Result<()> {
        match time::timeout(timeout, self.conn.recv()).await {
            Ok(Ok(packet)) => self.absorb(packet).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(()),
        }
    }

    /// Polls the control stream until the lobby has a delegated endpoint.
    pub async fn wait_delegated(&mut self, timeout: Duration) -> anyhow::Result<LobbyTicket> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ticket) = self.ticket.filter(LobbyTicket::is_delegated) {
                return Ok(ticket);
            }
            anyhow::ensure!(
                Instant::now() < deadline,
                "lobby was never delegated an endpoint"
            );
            self.poll_tcp(Duration::from_millis(50)).await?;
        }
    }

    async fn absorb(&mut self, packet: Packet) -> anyhow::Result<()> {
        match packet {
            Packet::Ping => self.conn.send(&Packet::Pong).await?,
            Packet::Pong => {}
            Packet::LobbyOk { code, udp_port } => {
                self.ticket = Some(LobbyTicket { code, udp_port });
            }
            Packet::PlayerList { players } => self.roster = players,
            Packet::NewPlayer { entry } => {
                if !self.roster.iter().any(|e| e.session == entry.session) {
                    self.roster.push(entry);
                }
            }
            Packet::Message { text } => self.messages.push(text),
            Packet::LobbyError { reason } => {
                warn!(?reason, "lobby error from broker");
                self.ticket = None;
                anyhow::bail!("lobby error: {reason:?}");
            }
            other => debug!(packet = ?other, "ignoring control packet"),
        }
        Ok(())
    }

    fn game_addr(&self) -> anyhow::Result<SocketAddr> {
        let ticket = self
            .ticket
            .filter(LobbyTicket::is_delegated)
            .context("no delegated lobby endpoint")?;
        Ok(SocketAddr::new(self.server_ip, ticket.udp_port))
    }

    /// Binds this client's address to its session on the game server and
    /// waits for the first snapshot.
    pub async fn hello_udp(&mut self) -> anyhow::Result<Snapshot> {
        let addr = self.game_addr()?;
        udp_send(
            &self.udp,
            &Packet::HelloUdp {
                session: self.session,
            },
            addr,
        )
        .await?;
        let snap = self
            .recv_snapshot(Duration::from_secs(2))
            .await?
            .context("no snapshot after hello")?;
        Ok(snap)
    }

    /// Sends this tick's input bitmask.
    pub async fn send_input(&self, buttons: Buttons) -> anyhow::Result<()> {
        let addr = self.game_addr()?;
        udp_send(
            &self.udp,
            &Packet::Input {
                session: self.session,
                buttons,
            },
            addr,
        )
        .await?;
        Ok(())
    }

    /// Fires this tick.
    pub async fn send_shoot(&self) -> anyhow::Result<()> {
        let addr = self.game_addr()?;
        udp_send(
            &self.udp,
            &Packet::Shoot {
                session: self.session,
            },
            addr,
        )
        .await?;
        Ok(())
    }

    /// Waits for the next snapshot, absorbing leveling notices on the way.
    pub async fn recv_snapshot(&mut self, timeout: Duration) -> anyhow::Result<Option<Snapshot>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some((packet, _)) = udp_recv_timeout(&self.udp, remaining).await? else {
                return Ok(None);
            };
            match packet {
                Packet::Snapshot(snap) => {
                    self.latest = Some(snap.clone());
                    return Ok(Some(snap));
                }
                Packet::Leveling {
                    session,
                    level,
                    score,
                } => self.levelings.push((session, level, score)),
                other => debug!(packet = ?other, "ignoring datagram"),
            }
        }
    }

    /// Round-trip latency probe over the game socket.
    pub async fn ping_udp(&mut self, timeout: Duration) -> anyhow::Result<Option<Duration>> {
        let addr = self.game_addr()?;
        let token = self.ping_token;
        self.ping_token = self.ping_token.wrapping_add(1);

        let sent = Instant::now();
        udp_send(&self.udp, &Packet::PingUdp { token }, addr).await?;

        let deadline = sent + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some((packet, _)) = udp_recv_timeout(&self.udp, remaining).await? else {
                return Ok(None);
            };
            match packet {
                Packet::PongUdp { token: t } if t == token => {
                    return Ok(Some(sent.elapsed()));
                }
                Packet::Snapshot(snap) => self.latest = Some(snap),
                other => debug!(packet = ?other, "ignoring datagram"),
            }
        }
    }

    /// Most recently received snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// This client's player record in the latest snapshot.
    pub fn own_player(&self) -> Option<&blitz_shared::packet::PlayerSnap> {
        self.latest
            .as_ref()?
            .players
            .iter()
            .find(|p| p.session == self.session)
    }
}
