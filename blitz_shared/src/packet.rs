//! Wire protocol packets.
//!
//! Every packet is `[magic: u32][type: u8][payload]`, big-endian throughout,
//! `f32` carried as IEEE-754 bits. Payload layouts are fixed per type except
//! MESSAGE / PLAYER_LIST / SNAPSHOT, which carry length/count prefixes.
//!
//! Decoding validates the magic before anything else and rejects malformed
//! buffers wholly; encoding is total for any well-formed in-memory value.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::input::Buttons;
use crate::lobby::{LobbyCode, SessionId};
use crate::math::Vec2;

/// Leading magic for every packet ("BLZ1"). Bump the trailing byte on
/// incompatible wire revisions.
pub const PACKET_MAGIC: u32 = 0x424C_5A31;

/// Protocol version negotiated in the hello exchange.
pub const PROTOCOL_VERSION: u16 = 1;

/// Width of the fixed, NUL-padded display-name field.
pub const NAME_FIELD: usize = 16;

/// Decode failure taxonomy. A failed decode never leaves partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Leading magic does not match; the discriminant was never read.
    BadMagic,
    /// Unrecognized packet discriminant.
    UnknownType(u8),
    /// Buffer shorter than the payload requires.
    Truncated,
    /// A field holds an out-of-range or non-UTF-8 value.
    BadPayload,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BadMagic => write!(f, "bad packet magic"),
            DecodeError::UnknownType(t) => write!(f, "unknown packet type {t}"),
            DecodeError::Truncated => write!(f, "truncated packet"),
            DecodeError::BadPayload => write!(f, "malformed packet payload"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reason carried by REFUSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    BadHandshake = 1,
    ServerFull = 2,
    Timeout = 3,
    BadProtocol = 4,
}

impl RefuseReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RefuseReason::BadHandshake),
            2 => Some(RefuseReason::ServerFull),
            3 => Some(RefuseReason::Timeout),
            4 => Some(RefuseReason::BadProtocol),
            _ => None,
        }
    }
}

/// Reason carried by LOBBY_ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyDenyReason {
    NotAuthenticated = 1,
    Full = 2,
    NotFound = 3,
    InvalidState = 4,
    SpawnFailed = 5,
    Crashed = 6,
}

impl LobbyDenyReason {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(LobbyDenyReason::NotAuthenticated),
            2 => Some(LobbyDenyReason::Full),
            3 => Some(LobbyDenyReason::NotFound),
            4 => Some(LobbyDenyReason::InvalidState),
            5 => Some(LobbyDenyReason::SpawnFailed),
            6 => Some(LobbyDenyReason::Crashed),
            _ => None,
        }
    }
}

/// Monster archetype, visible on the wire in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonsterKind {
    Sine = 0,
    ZigZag = 1,
    Boss = 2,
}

impl MonsterKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MonsterKind::Sine),
            1 => Some(MonsterKind::ZigZag),
            2 => Some(MonsterKind::Boss),
            _ => None,
        }
    }
}

/// Roster entry carried by PLAYER_LIST / NEW_PLAYER.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub session: SessionId,
    pub name: String,
}

/// Per-player snapshot record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnap {
    /// Packed entity handle (`generation << 16 | slot`).
    pub entity: u32,
    pub session: SessionId,
    pub pos: Vec2,
    pub hp: u8,
    pub level: u8,
    pub score: u16,
}

/// Per-bullet snapshot record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BulletSnap {
    pub entity: u32,
    pub pos: Vec2,
    pub vel: Vec2,
    /// True for monster-owned bullets.
    pub hostile: bool,
}

/// Per-monster snapshot record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonsterSnap {
    pub entity: u32,
    pub pos: Vec2,
    pub kind: MonsterKind,
    pub hp: u8,
}

/// Full authoritative world state for one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub tick: u32,
    pub players: Vec<PlayerSnap>,
    pub bullets: Vec<BulletSnap>,
    pub monsters: Vec<MonsterSnap>,
}

/// Tagged union of every message exchanged between broker, simulation and
/// clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // ─── TCP: handshake and liveness ───
    ServerHello { protocol: u16 },
    ClientHello { protocol: u16, name: String },
    Ok { session: SessionId },
    Refused { reason: RefuseReason },
    Ping,
    Pong,

    // ─── TCP: lobby and roster ───
    Message { text: String },
    PlayerList { players: Vec<RosterEntry> },
    NewPlayer { entry: RosterEntry },
    CreateLobby,
    JoinLobby { code: LobbyCode },
    LobbyOk { code: LobbyCode, udp_port: u16 },
    LobbyError { reason: LobbyDenyReason },

    // ─── UDP: gameplay ───
    HelloUdp { session: SessionId },
    Input { session: SessionId, buttons: Buttons },
    Snapshot(Snapshot),
    Shoot { session: SessionId },
    Leveling { session: SessionId, level: u8, score: u16 },
    PingUdp { token: u32 },
    PongUdp { token: u32 },
}

// Wire discriminants. Never reorder; append only.
const T_SERVER_HELLO: u8 = 1;
const T_CLIENT_HELLO: u8 = 2;
const T_OK: u8 = 3;
const T_REFUSED: u8 = 4;
const T_PING: u8 = 5;
const T_PONG: u8 = 6;
const T_MESSAGE: u8 = 7;
const T_PLAYER_LIST: u8 = 8;
const T_NEW_PLAYER: u8 = 9;
const T_CREATE_LOBBY: u8 = 10;
const T_JOIN_LOBBY: u8 = 11;
const T_LOBBY_OK: u8 = 12;
const T_LOBBY_ERROR: u8 = 13;
const T_HELLO_UDP: u8 = 14;
const T_INPUT: u8 = 15;
const T_SNAPSHOT: u8 = 16;
const T_SHOOT: u8 = 17;
const T_LEVELING: u8 = 18;
const T_PING_UDP: u8 = 19;
const T_PONG_UDP: u8 = 20;

impl Packet {
    fn type_byte(&self) -> u8 {
        match self {
            Packet::ServerHello { .. } => T_SERVER_HELLO,
            Packet::ClientHello { .. } => T_CLIENT_HELLO,
            Packet::Ok { .. } => T_OK,
            Packet::Refused { .. } => T_REFUSED,
            Packet::Ping => T_PING,
            Packet::Pong => T_PONG,
            Packet::Message { .. } => T_MESSAGE,
            Packet::PlayerList { .. } => T_PLAYER_LIST,
            Packet::NewPlayer { .. } => T_NEW_PLAYER,
            Packet::CreateLobby => T_CREATE_LOBBY,
            Packet::JoinLobby { .. } => T_JOIN_LOBBY,
            Packet::LobbyOk { .. } => T_LOBBY_OK,
            Packet::LobbyError { .. } => T_LOBBY_ERROR,
            Packet::HelloUdp { .. } => T_HELLO_UDP,
            Packet::Input { .. } => T_INPUT,
            Packet::Snapshot(_) => T_SNAPSHOT,
            Packet::Shoot { .. } => T_SHOOT,
            Packet::Leveling { .. } => T_LEVELING,
            Packet::PingUdp { .. } => T_PING_UDP,
            Packet::PongUdp { .. } => T_PONG_UDP,
        }
    }

    /// Serializes the packet. Total for any in-memory value.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(PACKET_MAGIC);
        buf.put_u8(self.type_byte());

        match self {
            Packet::ServerHello { protocol } => buf.put_u16(*protocol),
            Packet::ClientHello { protocol, name } => {
                buf.put_u16(*protocol);
                put_name(&mut buf, name);
            }
            Packet::Ok { session } => buf.put_u16(session.0),
            Packet::Refused { reason } => buf.put_u8(*reason as u8),
            Packet::Ping | Packet::Pong | Packet::CreateLobby => {}
            Packet::Message { text } => {
                let bytes = text.as_bytes();
                let len = bytes.len().min(u16::MAX as usize);
                buf.put_u16(len as u16);
                buf.put_slice(&bytes[..len]);
            }
            Packet::PlayerList { players } => {
                buf.put_u16(players.len() as u16);
                for entry in players {
                    buf.put_u16(entry.session.0);
                    put_name(&mut buf, &entry.name);
                }
            }
            Packet::NewPlayer { entry } => {
                buf.put_u16(entry.session.0);
                put_name(&mut buf, &entry.name);
            }
            Packet::JoinLobby { code } => buf.put_slice(code.as_bytes()),
            Packet::LobbyOk { code, udp_port } => {
                buf.put_slice(code.as_bytes());
                buf.put_u16(*udp_port);
            }
            Packet::LobbyError { reason } => buf.put_u8(*reason as u8),
            Packet::HelloUdp { session } => buf.put_u16(session.0),
            Packet::Input { session, buttons } => {
                buf.put_u16(session.0);
                buf.put_u8(buttons.bits());
            }
            Packet::Snapshot(snap) => encode_snapshot(&mut buf, snap),
            Packet::Shoot { session } => buf.put_u16(session.0),
            Packet::Leveling {
                session,
                level,
                score,
            } => {
                buf.put_u16(session.0);
                buf.put_u8(*level);
                buf.put_u16(*score);
            }
            Packet::PingUdp { token } | Packet::PongUdp { token } => buf.put_u32(*token),
        }

        buf.freeze()
    }

    /// Parses one packet from a buffer. Trailing bytes after a complete
    /// packet are ignored (datagram padding).
    pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(data);
        if r.u32()? != PACKET_MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let ty = r.u8()?;
        let packet = match ty {
            T_SERVER_HELLO => Packet::ServerHello { protocol: r.u16()? },
            T_CLIENT_HELLO => Packet::ClientHello {
                protocol: r.u16()?,
                name: read_name(&mut r)?,
            },
            T_OK => Packet::Ok {
                session: SessionId(r.u16()?),
            },
            T_REFUSED => Packet::Refused {
                reason: RefuseReason::from_u8(r.u8()?).ok_or(DecodeError::BadPayload)?,
            },
            T_PING => Packet::Ping,
            T_PONG => Packet::Pong,
            T_MESSAGE => {
                let len = r.u16()? as usize;
                let bytes = r.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::BadPayload)?
                    .to_string();
                Packet::Message { text }
            }
            T_PLAYER_LIST => {
                let count = r.u16()?;
                let mut players = Vec::with_capacity(count.min(256) as usize);
                for _ in 0..count {
                    players.push(RosterEntry {
                        session: SessionId(r.u16()?),
                        name: read_name(&mut r)?,
                    });
                }
                Packet::PlayerList { players }
            }
            T_NEW_PLAYER => Packet::NewPlayer {
                entry: RosterEntry {
                    session: SessionId(r.u16()?),
                    name: read_name(&mut r)?,
                },
            },
            T_CREATE_LOBBY => Packet::CreateLobby,
            T_JOIN_LOBBY => Packet::JoinLobby {
                code: read_code(&mut r)?,
            },
            T_LOBBY_OK => Packet::LobbyOk {
                code: read_code(&mut r)?,
                udp_port: r.u16()?,
            },
            T_LOBBY_ERROR => Packet::LobbyError {
                reason: LobbyDenyReason::from_u8(r.u8()?).ok_or(DecodeError::BadPayload)?,
            },
            T_HELLO_UDP => Packet::HelloUdp {
                session: SessionId(r.u16()?),
            },
            T_INPUT => Packet::Input {
                session: SessionId(r.u16()?),
                buttons: Buttons::from_bits_truncate(r.u8()?),
            },
            T_SNAPSHOT => Packet::Snapshot(decode_snapshot(&mut r)?),
            T_SHOOT => Packet::Shoot {
                session: SessionId(r.u16()?),
            },
            T_LEVELING => Packet::Leveling {
                session: SessionId(r.u16()?),
                level: r.u8()?,
                score: r.u16()?,
            },
            T_PING_UDP => Packet::PingUdp { token: r.u32()? },
            T_PONG_UDP => Packet::PongUdp { token: r.u32()? },
            other => return Err(DecodeError::UnknownType(other)),
        };

        Ok(packet)
    }
}

fn encode_snapshot(buf: &mut BytesMut, snap: &Snapshot) {
    buf.put_u32(snap.tick);

    buf.put_u16(snap.players.len() as u16);
    for p in &snap.players {
        buf.put_u32(p.entity);
        buf.put_u16(p.session.0);
        buf.put_f32(p.pos.x);
        buf.put_f32(p.pos.y);
        buf.put_u8(p.hp);
        buf.put_u8(p.level);
        buf.put_u16(p.score);
    }

    buf.put_u16(snap.bullets.len() as u16);
    for b in &snap.bullets {
        buf.put_u32(b.entity);
        buf.put_f32(b.pos.x);
        buf.put_f32(b.pos.y);
        buf.put_f32(b.vel.x);
        buf.put_f32(b.vel.y);
        buf.put_u8(b.hostile as u8);
    }

    buf.put_u16(snap.monsters.len() as u16);
    for m in &snap.monsters {
        buf.put_u32(m.entity);
        buf.put_f32(m.pos.x);
        buf.put_f32(m.pos.y);
        buf.put_u8(m.kind as u8);
        buf.put_u8(m.hp);
    }
}

fn decode_snapshot(r: &mut Reader<'_>) -> Result<Snapshot, DecodeError> {
    let tick = r.u32()?;

    let count = r.u16()?;
    let mut players = Vec::with_capacity(count.min(256) as usize);
    for _ in 0..count {
        players.push(PlayerSnap {
            entity: r.u32()?,
            session: SessionId(r.u16()?),
            pos: Vec2::new(r.f32()?, r.f32()?),
            hp: r.u8()?,
            level: r.u8()?,
            score: r.u16()?,
        });
    }

    let count = r.u16()?;
    let mut bullets = Vec::with_capacity(count.min(256) as usize);
    for _ in 0..count {
        bullets.push(BulletSnap {
            entity: r.u32()?,
            pos: Vec2::new(r.f32()?, r.f32()?),
            vel: Vec2::new(r.f32()?, r.f32()?),
            hostile: r.u8()? != 0,
        });
    }

    let count = r.u16()?;
    let mut monsters = Vec::with_capacity(count.min(256) as usize);
    for _ in 0..count {
        monsters.push(MonsterSnap {
            entity: r.u32()?,
            pos: Vec2::new(r.f32()?, r.f32()?),
            kind: MonsterKind::from_u8(r.u8()?).ok_or(DecodeError::BadPayload)?,
            hp: r.u8()?,
        });
    }

    Ok(Snapshot {
        tick,
        players,
        bullets,
        monsters,
    })
}

fn put_name(buf: &mut BytesMut, name: &str) {
    let mut field = [0u8; NAME_FIELD];
    let mut len = name.len().min(NAME_FIELD);
    // Back off to a char boundary so the field stays valid UTF-8.
    while len > 0 && !name.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf.put_slice(&field);
}

fn read_name(r: &mut Reader<'_>) -> Result<String, DecodeError> {
    let raw = r.take(NAME_FIELD)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
    let name = std::str::from_utf8(&raw[..end]).map_err(|_| DecodeError::BadPayload)?;
    Ok(name.to_string())
}

fn read_code(r: &mut Reader<'_>) -> Result<LobbyCode, DecodeError> {
    let raw = r.take(crate::lobby::LOBBY_CODE_LEN)?;
    let mut bytes = [0u8; crate::lobby::LOBBY_CODE_LEN];
    bytes.copy_from_slice(raw);
    LobbyCode::from_bytes(bytes).ok_or(DecodeError::BadPayload)
}

/// Bounds-checked big-endian reader over a borrowed buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(p: Packet) {
        let bytes = p.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn fixed_payloads_roundtrip() {
        roundtrip(Packet::ServerHello {
            protocol: PROTOCOL_VERSION,
        });
        roundtrip(Packet::ClientHello {
            protocol: PROTOCOL_VERSION,
            name: "Ace".to_string(),
        });
        roundtrip(Packet::Ok {
            session: SessionId(7),
        });
        roundtrip(Packet::Refused {
            reason: RefuseReason::BadHandshake,
        });
        roundtrip(Packet::Ping);
        roundtrip(Packet::CreateLobby);
        roundtrip(Packet::JoinLobby {
            code: LobbyCode::parse("ABC123").unwrap(),
        });
        roundtrip(Packet::LobbyOk {
            code: LobbyCode::PUBLIC,
            udp_port: 50123,
        });
        roundtrip(Packet::LobbyError {
            reason: LobbyDenyReason::Full,
        });
        roundtrip(Packet::HelloUdp {
            session: SessionId(3),
        });
        roundtrip(Packet::Input {
            session: SessionId(3),
            buttons: Buttons::RIGHT | Buttons::SHOOT,
        });
        roundtrip(Packet::Shoot {
            session: SessionId(3),
        });
        roundtrip(Packet::Leveling {
            session: SessionId(3),
            level: 2,
            score: 60,
        });
        roundtrip(Packet::PingUdp { token: 0xDEAD });
        roundtrip(Packet::PongUdp { token: 0xDEAD });
    }

    #[test]
    fn counted_payloads_roundtrip() {
        roundtrip(Packet::Message {
            text: "CHAT:Ace: hello".to_string(),
        });
        roundtrip(Packet::PlayerList {
            players: vec![
                RosterEntry {
                    session: SessionId(1),
                    name: "Ace".to_string(),
                },
                RosterEntry {
                    session: SessionId(2),
                    name: "Bandit".to_string(),
                },
            ],
        });
        roundtrip(Packet::Snapshot(Snapshot {
            tick: 42,
            players: vec![PlayerSnap {
                entity: 0x0001_0002,
                session: SessionId(1),
                pos: Vec2::new(12.5, 88.0),
                hp: 5,
                level: 1,
                score: 30,
            }],
            bullets: vec![BulletSnap {
                entity: 0x0000_0003,
                pos: Vec2::new(40.0, 88.0),
                vel: Vec2::new(160.0, 0.0),
                hostile: false,
            }],
            monsters: vec![MonsterSnap {
                entity: 0x0002_0004,
                pos: Vec2::new(200.0, 100.0),
                kind: MonsterKind::ZigZag,
                hp: 3,
            }],
        }));
    }

    #[test]
    fn bad_magic_rejected_before_type() {
        let mut bytes = Packet::Ping.encode().to_vec();
        bytes[0] ^= 0xFF;
        // Even with a garbage discriminant the failure is BadMagic.
        bytes[4] = 0xEE;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Packet::Ping.encode().to_vec();
        bytes[4] = 99;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::UnknownType(99)));
    }

    #[test]
    fn truncated_payload_rejected() {
        let bytes = Packet::Ok {
            session: SessionId(7),
        }
        .encode();
        assert_eq!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated)
        );
        assert_eq!(Packet::decode(&bytes[..3]), Err(DecodeError::Truncated));
    }

    #[test]
    fn declared_length_beyond_buffer_rejected() {
        let mut bytes = Packet::Message {
            text: "hi".to_string(),
        }
        .encode()
        .to_vec();
        // Claim a longer text than the buffer holds.
        bytes[5] = 0xFF;
        bytes[6] = 0xFF;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::Truncated));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let mut bytes = Packet::PingUdp { token: 9 }.encode().to_vec();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::PingUdp { token: 9 }
        );
    }

    #[test]
    fn long_names_truncate_on_char_boundary() {
        let p = Packet::ClientHello {
            protocol: PROTOCOL_VERSION,
            name: "abcdefghijklmnñop".to_string(),
        };
        let bytes = p.encode();
        match Packet::decode(&bytes).unwrap() {
            Packet::ClientHello { name, .. } => {
                assert!(name.len() <= NAME_FIELD);
                assert!(name.starts_with("abcdefghijklmn"));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
