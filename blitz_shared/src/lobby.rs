//! Session and lobby tables.
//!
//! The broker owns exactly one of these; every mutation goes through the
//! broker's single lock. Sessions exist only after a completed hello
//! exchange, so holding a `SessionId` implies an authenticated client.
//!
//! # Lobby lifecycle
//! 1. A session creates a lobby (or joins `PUBLIC`, created on demand).
//! 2. Other sessions join by code until the lobby is full.
//! 3. When membership first reaches the configured minimum the lobby is
//!    delegated to a dedicated simulation process, exactly once.
//! 4. The lobby dies when its last member leaves or its process exits.

use std::collections::HashMap;
use std::fmt;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One authenticated TCP-connected client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const LOBBY_CODE_LEN: usize = 6;

const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Six uppercase alphanumeric characters identifying a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LobbyCode([u8; LOBBY_CODE_LEN]);

impl LobbyCode {
    /// Reserved auto-matchmaking lobby, created on demand by joins.
    pub const PUBLIC: LobbyCode = LobbyCode(*b"PUBLIC");

    /// Validates raw bytes into a code.
    pub fn from_bytes(raw: [u8; LOBBY_CODE_LEN]) -> Option<Self> {
        if raw.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            Some(LobbyCode(raw))
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let bytes: [u8; LOBBY_CODE_LEN] = s.as_bytes().try_into().ok()?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LOBBY_CODE_LEN] {
        &self.0
    }

    fn random(rng: &mut SmallRng) -> Self {
        let mut code = [0u8; LOBBY_CODE_LEN];
        for ch in &mut code {
            *ch = CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())];
        }
        LobbyCode(code)
    }
}

impl fmt::Display for LobbyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Constructed from validated ASCII only.
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("??????"))
    }
}

/// Session record owned by the broker.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub lobby: Option<LobbyCode>,
}

/// Lobby record owned by the broker.
#[derive(Debug, Clone)]
pub struct LobbyInfo {
    pub code: LobbyCode,
    /// Member sessions ordered by join time.
    pub members: Vec<SessionId>,
    pub max_members: usize,
    /// UDP endpoint port once delegated to a child process.
    pub udp_port: Option<u16>,
}

impl LobbyInfo {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_members
    }

    pub fn is_member(&self, session: SessionId) -> bool {
        self.members.contains(&session)
    }

    pub fn is_delegated(&self) -> bool {
        self.udp_port.is_some()
    }
}

/// Lobby operation errors, surfaced to the offending client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyError {
    NotAuthenticated,
    LobbyFull,
    LobbyNotFound,
}

impl fmt::Display for LobbyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LobbyError::NotAuthenticated => write!(f, "session not authenticated"),
            LobbyError::LobbyFull => write!(f, "lobby is full"),
            LobbyError::LobbyNotFound => write!(f, "no such lobby"),
        }
    }
}

impl std::error::Error for LobbyError {}

/// Outcome of a member leaving a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeftLobby {
    pub code: LobbyCode,
    /// The lobby record was destroyed because this was the last member.
    pub now_empty: bool,
}

/// Tracks connected sessions, lobby membership and delegation state.
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    lobbies: HashMap<LobbyCode, LobbyInfo>,
    next_id: u16,
    max_lobby_players: usize,
    min_players_to_start: usize,
    rng: SmallRng,
}

impl SessionManager {
    pub fn new(max_lobby_players: usize, min_players_to_start: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            lobbies: HashMap::new(),
            next_id: 1,
            max_lobby_players: max_lobby_players.max(1),
            min_players_to_start: min_players_to_start.max(1),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Registers an authenticated session (call after a completed hello).
    pub fn create_session(&mut self, name: String) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.sessions.insert(
            id,
            Session {
                id,
                name,
                lobby: None,
            },
        );
        id
    }

    /// Removes a session, leaving its lobby first. Returns what was left.
    pub fn remove_session(&mut self, id: SessionId) -> (Option<Session>, Option<LeftLobby>) {
        let left = self.leave_lobby(id);
        (self.sessions.remove(&id), left)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Replaces a session's display name.
    pub fn set_name(&mut self, id: SessionId, name: String) {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.name = name;
        }
    }

    pub fn lobby(&self, code: LobbyCode) -> Option<&LobbyInfo> {
        self.lobbies.get(&code)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.len()
    }

    /// Members of a lobby, in join order.
    pub fn members(&self, code: LobbyCode) -> Vec<SessionId> {
        self.lobbies
            .get(&code)
            .map(|l| l.members.clone())
            .unwrap_or_default()
    }

    fn fresh_code(&mut self) -> LobbyCode {
        loop {
            let code = LobbyCode::random(&mut self.rng);
            if code != LobbyCode::PUBLIC && !self.lobbies.contains_key(&code) {
                return code;
            }
        }
    }

    /// Creates a lobby and joins the creator to it. A session in another
    /// lobby leaves it first (a session belongs to at most one lobby).
    pub fn create_lobby(&mut self, session: SessionId) -> Result<LobbyCode, LobbyError> {
        if !self.sessions.contains_key(&session) {
            return Err(LobbyError::NotAuthenticated);
        }
        let code = self.fresh_code();
        self.leave_lobby(session);
        self.lobbies.insert(
            code,
            LobbyInfo {
                code,
                members: vec![session],
                max_members: self.max_lobby_players,
                udp_port: None,
            },
        );
        if let Some(s) = self.sessions.get_mut(&session) {
            s.lobby = Some(code);
        }
        Ok(code)
    }

    /// Joins an existing lobby. `PUBLIC` is created on demand. On failure
    /// membership is unchanged, including the joiner's current lobby.
    pub fn join_lobby(&mut self, session: SessionId, code: LobbyCode) -> Result<(), LobbyError> {
        if !self.sessions.contains_key(&session) {
            return Err(LobbyError::NotAuthenticated);
        }
        match self.lobbies.get(&code) {
            Some(lobby) => {
                if lobby.is_member(session) {
                    return Ok(());
                }
                if lobby.is_full() {
                    return Err(LobbyError::LobbyFull);
                }
            }
            None if code == LobbyCode::PUBLIC => {
                self.lobbies.insert(
                    code,
                    LobbyInfo {
                        code,
                        members: Vec::new(),
                        max_members: self.max_lobby_players,
                        udp_port: None,
                    },
                );
            }
            None => return Err(LobbyError::LobbyNotFound),
        }

        self.leave_lobby(session);
        if let Some(lobby) = self.lobbies.get_mut(&code) {
            lobby.members.push(session);
        }
        if let Some(s) = self.sessions.get_mut(&session) {
            s.lobby = Some(code);
        }
        Ok(())
    }

    /// Removes a session from its lobby, destroying the lobby record when
    /// the last member leaves.
    pub fn leave_lobby(&mut self, session: SessionId) -> Option<LeftLobby> {
        let code = self.sessions.get_mut(&session).and_then(|s| s.lobby.take())?;
        let lobby = self.lobbies.get_mut(&code)?;
        lobby.members.retain(|&m| m != session);
        let now_empty = lobby.members.is_empty();
        if now_empty {
            self.lobbies.remove(&code);
        }
        Some(LeftLobby { code, now_empty })
    }

    /// Destroys a lobby record outright (process exit, crash eviction) and
    /// detaches every member. Returns the evicted members.
    pub fn remove_lobby(&mut self, code: LobbyCode) -> Vec<SessionId> {
        let Some(lobby) = self.lobbies.remove(&code) else {
            return Vec::new();
        };
        for member in &lobby.members {
            if let Some(s) = self.sessions.get_mut(member) {
                s.lobby = None;
            }
        }
        lobby.members
    }

    /// Whether the lobby should be handed to a child process now: membership
    /// has reached the minimum and no delegation has happened yet.
    pub fn should_delegate(&self, code: LobbyCode) -> bool {
        self.lobbies.get(&code).is_some_and(|l| {
            l.udp_port.is_none() && l.member_count() >= self.min_players_to_start
        })
    }

    /// Records the delegated endpoint. Idempotent: only the first call wins.
    pub fn mark_delegated(&mut self, code: LobbyCode, udp_port: u16) -> bool {
        match self.lobbies.get_mut(&code) {
            Some(lobby) if lobby.udp_port.is_none() => {
                lobby.udp_port = Some(udp_port);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(2, 2)
    }

    #[test]
    fn create_lobby_joins_creator() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let code = mgr.create_lobby(a).unwrap();

        let lobby = mgr.lobby(code).unwrap();
        assert_eq!(lobby.members, vec![a]);
        assert_eq!(mgr.session(a).unwrap().lobby, Some(code));
    }

    #[test]
    fn unknown_session_cannot_create() {
        let mut mgr = manager();
        assert_eq!(
            mgr.create_lobby(SessionId(99)),
            Err(LobbyError::NotAuthenticated)
        );
    }

    #[test]
    fn join_keeps_join_order() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let b = mgr.create_session("Bandit".into());
        let code = mgr.create_lobby(a).unwrap();
        mgr.join_lobby(b, code).unwrap();
        assert_eq!(mgr.members(code), vec![a, b]);
    }

    #[test]
    fn join_full_lobby_fails_without_side_effects() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let b = mgr.create_session("Bandit".into());
        let c = mgr.create_session("Crash".into());
        let code = mgr.create_lobby(a).unwrap();
        mgr.join_lobby(b, code).unwrap();

        assert_eq!(mgr.join_lobby(c, code), Err(LobbyError::LobbyFull));
        assert_eq!(mgr.members(code), vec![a, b]);
        assert_eq!(mgr.session(c).unwrap().lobby, None);
    }

    #[test]
    fn join_unknown_code_fails() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let code = LobbyCode::parse("ZZZZZ9").unwrap();
        assert_eq!(mgr.join_lobby(a, code), Err(LobbyError::LobbyNotFound));
    }

    #[test]
    fn public_lobby_created_on_demand() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        mgr.join_lobby(a, LobbyCode::PUBLIC).unwrap();
        assert!(mgr.lobby(LobbyCode::PUBLIC).is_some());
    }

    #[test]
    fn session_belongs_to_at_most_one_lobby() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let first = mgr.create_lobby(a).unwrap();
        let second = mgr.create_lobby(a).unwrap();

        // Leaving the first emptied and destroyed it.
        assert!(mgr.lobby(first).is_none());
        assert_eq!(mgr.members(second), vec![a]);
    }

    #[test]
    fn last_leave_destroys_lobby() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let code = mgr.create_lobby(a).unwrap();

        let left = mgr.leave_lobby(a).unwrap();
        assert_eq!(left.code, code);
        assert!(left.now_empty);
        assert!(mgr.lobby(code).is_none());
    }

    #[test]
    fn delegation_happens_once_at_minimum() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let b = mgr.create_session("Bandit".into());
        let code = mgr.create_lobby(a).unwrap();

        assert!(!mgr.should_delegate(code));
        mgr.join_lobby(b, code).unwrap();
        assert!(mgr.should_delegate(code));

        assert!(mgr.mark_delegated(code, 50001));
        assert!(!mgr.should_delegate(code));
        assert!(!mgr.mark_delegated(code, 50002));
        assert_eq!(mgr.lobby(code).unwrap().udp_port, Some(50001));
    }

    #[test]
    fn remove_lobby_detaches_members() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let b = mgr.create_session("Bandit".into());
        let code = mgr.create_lobby(a).unwrap();
        mgr.join_lobby(b, code).unwrap();

        let evicted = mgr.remove_lobby(code);
        assert_eq!(evicted, vec![a, b]);
        assert_eq!(mgr.session(a).unwrap().lobby, None);
        assert_eq!(mgr.session(b).unwrap().lobby, None);
    }

    #[test]
    fn generated_codes_are_well_formed() {
        let mut mgr = manager();
        let a = mgr.create_session("Ace".into());
        let code = mgr.create_lobby(a).unwrap();
        assert!(LobbyCode::parse(&code.to_string()).is_some());
        assert_ne!(code, LobbyCode::PUBLIC);
    }
}
