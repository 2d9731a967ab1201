//! Control channel between the broker's supervisor and a lobby's simulation
//! process.
//!
//! Messages are JSON datagrams over a loopback UDP socket pair: the
//! supervisor binds an ephemeral port and passes it to the child on its
//! command line; the child connects back and opens with `Ready`. The message
//! set is closed and control-plane only — gameplay traffic goes directly
//! client↔child over the game socket and never crosses this channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time};
use tracing::warn;

use crate::lobby::SessionId;

const MAX_CONTROL_MSG: usize = 1024;

/// Closed set of control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsg {
    // ─── Child → supervisor ───
    /// Child is listening for gameplay traffic on this port.
    Ready { udp_port: u16 },
    /// A session's player died in the simulation.
    PlayerDied { session: SessionId },
    /// A session went silent and was evicted.
    Dropped { session: SessionId },
    /// The boss entered the field.
    BossSpawned,
    /// The boss was destroyed.
    BossDefeated,
    /// The last player is gone; the child will drain and exit.
    NoPlayers,

    // ─── Supervisor → child ───
    /// Admit a session to the lobby roster.
    Attach { session: SessionId },
    /// Revoke a session (TCP disconnect or lobby leave).
    Detach { session: SessionId },
    /// Graceful shutdown request.
    Shutdown,
}

/// One end of the control channel.
pub struct ControlChannel {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl ControlChannel {
    /// Supervisor side: bind an ephemeral loopback port. The peer address is
    /// learned from the child's first datagram.
    pub async fn bind_local() -> anyhow::Result<Self> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let socket = UdpSocket::bind(bind).await.context("ipc bind")?;
        Ok(Self { socket, peer: None })
    }

    /// Child side: connect to the supervisor's port.
    pub async fn connect_local(port: u16) -> anyhow::Result<Self> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let socket = UdpSocket::bind(bind).await.context("ipc bind")?;
        socket.connect(peer).await.context("ipc connect")?;
        Ok(Self {
            socket,
            peer: Some(peer),
        })
    }

    pub fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr().context("ipc local_addr")?.port())
    }

    pub async fn send(&self, msg: &ControlMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize control msg")?;
        let peer = self.peer.context("control peer not known yet")?;
        self.socket
            .send_to(&payload, peer)
            .await
            .context("ipc send")?;
        Ok(())
    }

    /// Waits for the next well-formed control message, learning the peer
    /// address from it. Malformed datagrams are logged and skipped.
    pub async fn recv(&mut self) -> anyhow::Result<ControlMsg> {
        let mut buf = vec![0u8; MAX_CONTROL_MSG];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await.context("ipc recv")?;
            match serde_json::from_slice::<ControlMsg>(&buf[..n]) {
                Ok(msg) => {
                    self.peer = Some(from);
                    return Ok(msg);
                }
                Err(e) => warn!(error = %e, "dropping malformed control datagram"),
            }
        }
    }

    /// Receives a control message within the given timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ControlMsg>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drains one pending control message without waiting. Malformed
    /// datagrams are skipped.
    pub fn try_recv(&mut self) -> anyhow::Result<Option<ControlMsg>> {
        let mut buf = vec![0u8; MAX_CONTROL_MSG];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => match serde_json::from_slice::<ControlMsg>(&buf[..n]) {
                    Ok(msg) => {
                        self.peer = Some(from);
                        return Ok(Some(msg));
                    }
                    Err(e) => warn!(error = %e, "dropping malformed control datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e).context("ipc try_recv"),
            }
        }
    }
}
