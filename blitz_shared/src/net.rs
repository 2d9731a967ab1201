//! Transport helpers.
//!
//! Two transports, chosen per component at construction:
//! - stream-oriented: [`TcpConn`] carries packets with a `u16` length prefix
//!   over TCP (broker ↔ client control traffic),
//! - datagram-oriented: plain `UdpSocket`s carry one packet per datagram
//!   (gameplay traffic), with the helpers below for encode/decode at the
//!   socket boundary.
//!
//! A malformed packet inside an intact frame is dropped and the stream keeps
//! going; only transport errors tear the connection down.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};
use tracing::debug;

use crate::packet::Packet;

/// Frames fit a `u16` length prefix.
pub const MAX_FRAME: usize = u16::MAX as usize;

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> anyhow::Result<()> {
    let payload = packet.encode();
    anyhow::ensure!(payload.len() <= MAX_FRAME, "packet too large for framing");
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Packet> {
    loop {
        let mut len_buf = [0u8; 2];
        reader
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        match Packet::decode(&payload) {
            Ok(packet) => return Ok(packet),
            // Framing is intact, so skip the bad packet and keep reading.
            Err(e) => debug!(error = %e, "dropping malformed framed packet"),
        }
    }
}

/// Reliable packet stream over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct TcpConn {
    stream: TcpStream,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, packet: &Packet) -> anyhow::Result<()> {
        write_frame(&mut self.stream, packet).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<Packet> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read/write halves so one task can
    /// read while broadcasts write.
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        let (read, write) = self.stream.into_split();
        (PacketReader { half: read }, PacketWriter { half: write })
    }
}

/// Read half of a split [`TcpConn`].
#[derive(Debug)]
pub struct PacketReader {
    half: OwnedReadHalf,
}

impl PacketReader {
    pub async fn recv(&mut self) -> anyhow::Result<Packet> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a split [`TcpConn`].
#[derive(Debug)]
pub struct PacketWriter {
    half: OwnedWriteHalf,
}

impl PacketWriter {
    pub async fn send(&mut self, packet: &Packet) -> anyhow::Result<()> {
        write_frame(&mut self.half, packet).await
    }

    /// Flushes and closes the write direction, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.half.shutdown().await.context("tcp shutdown")
    }
}

/// TCP server listener.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(TcpConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((TcpConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Sends one packet as one datagram. Best-effort; the caller decides whether
/// a failure matters.
pub async fn udp_send(socket: &UdpSocket, packet: &Packet, to: SocketAddr) -> std::io::Result<()> {
    socket.send_to(&packet.encode(), to).await?;
    Ok(())
}

/// Receives one well-formed packet within the timeout. Malformed datagrams
/// are dropped without a response and the wait continues.
pub async fn udp_recv_timeout(
    socket: &UdpSocket,
    timeout: Duration,
) -> anyhow::Result<Option<(Packet, SocketAddr)>> {
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => match Packet::decode(&buf[..n]) {
                Ok(packet) => return Ok(Some((packet, from))),
                Err(e) => debug!(error = %e, %from, "dropping malformed datagram"),
            },
            Ok(Err(e)) => return Err(e).context("udp recv"),
            Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PROTOCOL_VERSION};

    #[tokio::test]
    async fn framed_packets_roundtrip_over_tcp() -> anyhow::Result<()> {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse()?).await?;
        let addr = acceptor.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut conn, _) = acceptor.accept().await?;
            let got = conn.recv().await?;
            conn.send(&got).await?;
            Ok::<_, anyhow::Error>(())
        });

        let mut client = TcpConn::connect(addr).await?;
        let sent = Packet::ServerHello {
            protocol: PROTOCOL_VERSION,
        };
        client.send(&sent).await?;
        assert_eq!(client.recv().await?, sent);

        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn udp_helpers_roundtrip() -> anyhow::Result<()> {
        let a = UdpSocket::bind("127.0.0.1:0").await?;
        let b = UdpSocket::bind("127.0.0.1:0").await?;
        let b_addr = b.local_addr()?;

        udp_send(&a, &Packet::PingUdp { token: 7 }, b_addr).await?;
        let (packet, from) = udp_recv_timeout(&b, Duration::from_millis(200))
            .await?
            .expect("datagram");
        assert_eq!(packet, Packet::PingUdp { token: 7 });
        assert_eq!(from, a.local_addr()?);
        Ok(())
    }
}
