//! Game world state and simulation (server authoritative).
//!
//! Owns every player, monster and bullet for one lobby, built on the typed
//! component store. All networking stays in [`crate::server`]; this module
//! only handles game logic and state.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep; motion uses accumulated tick time,
//!   never wall clock.
//! - Spawn jitter comes from a seedable RNG; the boss trigger is pure
//!   arithmetic on the lobby score.
//! - Passes iterate entities in slot order.

use std::fmt;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use blitz_shared::{
    ecs::{
        input_pass, movement_pass, EntityId, InputController, InvalidHandle, Position, Velocity,
        World,
    },
    event::Latch,
    input::Buttons,
    lobby::SessionId,
    math::{aabb_overlap, Vec2},
    packet::{BulletSnap, MonsterKind, MonsterSnap, Packet, PlayerSnap, Snapshot},
};

/// Playfield bounds; positions live in `[0, WORLD_MAX]` on both axes.
pub const WORLD_MAX: f32 = 255.0;

/// Horizontal speed applied while a directional button is held.
pub const PLAYER_SPEED: f32 = 80.0;

/// Player bullets travel rightward at this speed.
pub const PLAYER_BULLET_SPEED: f32 = 160.0;

pub const PLAYER_HP: u8 = 5;
pub const KILL_SCORE: u16 = 10;
pub const LEVEL_STEP: u16 = 50;

/// Lobby score at which the boss enters, once per game.
pub const BOSS_SCORE_THRESHOLD: u16 = 100;

const PLAYER_SPAWN_X: f32 = 20.0;
const MONSTER_HP: i16 = 3;
const BOSS_HP: i16 = 40;
const HIT_COOLDOWN: f32 = 0.5;
const BOSS_BULLET_SPEED: f32 = 120.0;
const BOSS_FIRE_INTERVAL: f32 = 0.5;
const ZIGZAG_HALF_PERIOD: f32 = 0.4;
const MONSTER_UNIT_SPEED: f32 = 32.0;

const PLAYER_HALF: Vec2 = Vec2::new(16.5, 8.5);
const MONSTER_HALF: Vec2 = Vec2::new(9.0, 9.0);
const BOSS_HALF: Vec2 = Vec2::new(22.0, 22.0);
const BULLET_HALF: Vec2 = Vec2::new(3.0, 3.0);

// Boss patrol script: (vx, vy) in monster units, leg duration in seconds.
// Cycles forever; the boss is clamped to its arena box.
const BOSS_PATROL: &[(f32, f32, f32)] = &[
    (-1.0, 0.0, 1.5),
    (0.0, 1.4, 1.0),
    (-0.7, -1.4, 1.4),
    (0.9, 0.7, 1.2),
];

const BOSS_ARENA_MIN: Vec2 = Vec2::new(110.0, 20.0);
const BOSS_ARENA_MAX: Vec2 = Vec2::new(245.0, 235.0);

/// Lobby lifecycle as seen by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyPhase {
    /// No player has ever registered.
    Empty,
    /// At least one live player.
    Active,
    /// All players left; awaiting cleanup.
    Draining,
    /// Shut down; no further ticks expected.
    Closed,
}

/// The lobby's player cap was reached; registration refused, no state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded;

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lobby player capacity exceeded")
    }
}

impl std::error::Error for CapacityExceeded {}

/// Per-tick gameplay events drained by the transport loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    LevelUp {
        session: SessionId,
        level: u8,
        score: u16,
    },
    PlayerDied {
        session: SessionId,
    },
}

/// Player component.
#[derive(Debug, Clone, Copy)]
pub struct Player {
    pub session: SessionId,
    pub hp: u8,
    pub score: u16,
    pub level: u8,
    pub alive: bool,
    hit_cooldown: f32,
}

/// Monster component; motion state depends on the kind.
#[derive(Debug, Clone, Copy)]
pub struct Monster {
    pub kind: MonsterKind,
    pub hp: i16,
    base_y: f32,
    amplitude: f32,
    freq: f32,
    phase: f32,
    speed_x: f32,
    fire_cooldown: f32,
    leg: usize,
    leg_elapsed: f32,
}

/// Bullet component.
#[derive(Debug, Clone, Copy)]
pub struct Bullet {
    pub owner: EntityId,
    pub hostile: bool,
    pub damage: i16,
}

/// Authoritative world for one lobby.
pub struct GameWorld {
    world: World,
    phase: LobbyPhase,
    max_players: usize,

    time: f32,
    tick: u32,
    lobby_score: u16,
    had_players: bool,
    boss_spawned_once: bool,
    next_monster_spawn: f32,

    boss_spawned: Latch,
    boss_defeated: Latch,
    no_players: Latch,
    events: Vec<WorldEvent>,

    rng: SmallRng,
}

impl GameWorld {
    pub fn new(seed: u64, max_players: usize) -> Self {
        Self {
            world: World::default(),
            phase: LobbyPhase::Empty,
            max_players: max_players.max(1),
            time: 0.0,
            tick: 0,
            lobby_score: 0,
            had_players: false,
            boss_spawned_once: false,
            next_monster_spawn: 1.0,
            boss_spawned: Latch::default(),
            boss_defeated: Latch::default(),
            no_players: Latch::default(),
            events: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn lobby_score(&self) -> u16 {
        self.lobby_score
    }

    pub fn player_count(&self) -> usize {
        self.world.count::<Player>()
    }

    pub fn monster_count(&self) -> usize {
        self.world.count::<Monster>()
    }

    pub fn bullet_count(&self) -> usize {
        self.world.count::<Bullet>()
    }

    /// Whether any player has ever joined this world.
    pub fn has_had_players(&self) -> bool {
        self.had_players
    }

    /// One-shot: a boss entered the field since the last read.
    pub fn take_boss_spawned(&mut self) -> bool {
        self.boss_spawned.take()
    }

    /// One-shot: a boss was destroyed since the last read.
    pub fn take_boss_defeated(&mut self) -> bool {
        self.boss_defeated.take()
    }

    /// One-shot: the player count dropped to zero since the last read.
    pub fn take_no_players(&mut self) -> bool {
        self.no_players.take()
    }

    /// Drains the gameplay events produced since the last call.
    pub fn take_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    /// Entity of a registered session's player, if any.
    pub fn player_entity(&self, session: SessionId) -> Option<EntityId> {
        self.world
            .iter::<Player>()
            .find(|(_, p)| p.session == session)
            .map(|(e, _)| e)
    }

    /// Allocates a player for a session at the spawn column.
    pub fn register_player(&mut self, session: SessionId) -> Result<EntityId, CapacityExceeded> {
        if self.player_count() >= self.max_players {
            return Err(CapacityExceeded);
        }

        let lane = self.player_count() as f32;
        let entity = self.world.spawn();
        // The entity was just spawned; inserts cannot fail.
        let _ = self.world.insert(
            entity,
            Position(Vec2::new(PLAYER_SPAWN_X, 60.0 + lane * 45.0)),
        );
        let _ = self.world.insert(entity, Velocity(Vec2::ZERO));
        let _ = self.world.insert(entity, InputController::default());
        let _ = self.world.insert(
            entity,
            Player {
                session,
                hp: PLAYER_HP,
                score: 0,
                level: 1,
                alive: true,
                hit_cooldown: 0.0,
            },
        );

        self.had_players = true;
        self.phase = LobbyPhase::Active;
        info!(%session, entity = ?entity, "player registered");
        Ok(entity)
    }

    /// Removes a player and every bullet it owns. Fails with
    /// [`InvalidHandle`] for a destroyed, never-created, or non-player
    /// handle.
    pub fn remove_player(&mut self, entity: EntityId) -> Result<(), InvalidHandle> {
        let player = self
            .world
            .remove::<Player>(entity)?
            .ok_or(InvalidHandle(entity))?;

        let owned: Vec<EntityId> = self
            .world
            .iter::<Bullet>()
            .filter(|(_, b)| b.owner == entity)
            .map(|(e, _)| e)
            .collect();
        for bullet in owned {
            let _ = self.world.despawn(bullet);
        }
        self.world.despawn(entity)?;

        info!(session = %player.session, "player removed");
        if self.player_count() == 0 && self.had_players {
            self.no_players.set();
            self.phase = LobbyPhase::Draining;
        }
        Ok(())
    }

    /// Overwrites the player's pending input. Last-writer-wins within a
    /// tick; nothing queues across ticks.
    pub fn update_input(&mut self, entity: EntityId, buttons: Buttons) -> Result<(), InvalidHandle> {
        match self.world.get_mut::<InputController>(entity)? {
            Some(ctl) => {
                ctl.buttons = buttons;
                Ok(())
            }
            None => Err(InvalidHandle(entity)),
        }
    }

    /// Spawns a bullet at the owner's position, flying away from it.
    pub fn add_shot(&mut self, owner: EntityId) -> Result<EntityId, InvalidHandle> {
        let pos = self
            .world
            .get::<Position>(owner)?
            .ok_or(InvalidHandle(owner))?
            .0;
        let hostile = self.world.get::<Monster>(owner)?.is_some();
        let (offset, vel) = if hostile {
            (
                -BOSS_HALF.x - BULLET_HALF.x,
                Vec2::new(-BOSS_BULLET_SPEED, self.rng.gen_range(-40.0..40.0)),
            )
        } else {
            (
                PLAYER_HALF.x + BULLET_HALF.x,
                Vec2::new(PLAYER_BULLET_SPEED, 0.0),
            )
        };

        let bullet = self.world.spawn();
        let _ = self
            .world
            .insert(bullet, Position(Vec2::new(pos.x + offset, pos.y)));
        let _ = self.world.insert(bullet, Velocity(vel));
        let _ = self.world.insert(
            bullet,
            Bullet {
                owner,
                hostile,
                damage: 1,
            },
        );
        debug!(owner = ?owner, bullet = ?bullet, hostile, "shot fired");
        Ok(bullet)
    }

    /// Marks the world shut down. No partial tick is observable afterwards.
    pub fn close(&mut self) {
        self.phase = LobbyPhase::Closed;
    }

    /// Advances the simulation by one fixed step.
    pub fn tick(&mut self, dt: f32) {
        if self.phase == LobbyPhase::Closed {
            return;
        }
        self.time += dt;
        self.tick = self.tick.wrapping_add(1);

        // Input → velocity, plus pending shots.
        let shooters = input_pass(&mut self.world, PLAYER_SPEED);
        for owner in shooters {
            if let Err(e) = self.add_shot(owner) {
                warn!(error = %e, "skipping shot for invalid entity");
            }
        }

        // Players and bullets advance by their velocity.
        movement_pass(&mut self.world, dt);
        self.clamp_players(dt);
        self.cull_bullets();
        self.move_monsters(dt);
        self.resolve_collisions();
        self.reap_dead();
        self.spawn_wave();
    }

    fn clamp_players(&mut self, dt: f32) {
        for id in self.world.entities_with::<Player>() {
            if let Ok(Some(pos)) = self.world.get_mut::<Position>(id) {
                pos.0 = pos.0.clamp(0.0, WORLD_MAX);
            }
            if let Ok(Some(player)) = self.world.get_mut::<Player>(id) {
                player.hit_cooldown = (player.hit_cooldown - dt).max(0.0);
            }
        }
    }

    fn cull_bullets(&mut self) {
        let gone: Vec<EntityId> = self
            .world
            .iter::<Bullet>()
            .filter_map(|(e, _)| {
                let pos = self.world.get::<Position>(e).ok().flatten()?.0;
                let out = pos.x < -10.0 || pos.x > WORLD_MAX + 10.0 || pos.y < -10.0
                    || pos.y > WORLD_MAX + 10.0;
                out.then_some(e)
            })
            .collect();
        for e in gone {
            let _ = self.world.despawn(e);
        }
    }

    fn move_monsters(&mut self, dt: f32) {
        let mut offscreen = Vec::new();
        let mut boss_shots = Vec::new();

        for id in self.world.entities_with::<Monster>() {
            let Ok(Some(pos)) = self.world.get::<Position>(id) else {
                continue;
            };
            let mut pos = pos.0;
            let Ok(Some(monster)) = self.world.get_mut::<Monster>(id) else {
                continue;
            };

            match monster.kind {
                MonsterKind::Sine => {
                    monster.phase += monster.freq * dt;
                    pos.x += monster.speed_x * dt * MONSTER_UNIT_SPEED;
                    pos.y = monster.base_y + monster.amplitude * monster.phase.sin();
                }
                MonsterKind::ZigZag => {
                    monster.phase += dt;
                    pos.x += monster.speed_x * dt * MONSTER_UNIT_SPEED;
                    let up = monster.phase % (2.0 * ZIGZAG_HALF_PERIOD) < ZIGZAG_HALF_PERIOD;
                    pos.y = monster.base_y + if up { monster.amplitude } else { -monster.amplitude };
                }
                MonsterKind::Boss => {
                    monster.leg_elapsed += dt;
                    let (vx, vy, duration) = BOSS_PATROL[monster.leg % BOSS_PATROL.len()];
                    if monster.leg_elapsed >= duration {
                        monster.leg = (monster.leg + 1) % BOSS_PATROL.len();
                        monster.leg_elapsed = 0.0;
                    }
                    pos.x += vx * dt * MONSTER_UNIT_SPEED;
                    pos.y += vy * dt * MONSTER_UNIT_SPEED;
                    pos.x = pos.x.clamp(BOSS_ARENA_MIN.x, BOSS_ARENA_MAX.x);
                    pos.y = pos.y.clamp(BOSS_ARENA_MIN.y, BOSS_ARENA_MAX.y);

                    monster.fire_cooldown -= dt;
                    if monster.fire_cooldown <= 0.0 {
                        monster.fire_cooldown = BOSS_FIRE_INTERVAL;
                        boss_shots.push(id);
                    }
                }
            }

            if pos.x < -5.0 || pos.y < -5.0 || pos.y > WORLD_MAX + 5.0 {
                offscreen.push(id);
            } else if let Ok(Some(slot)) = self.world.get_mut::<Position>(id) {
                slot.0 = pos;
            }
        }

        for id in offscreen {
            let _ = self.world.despawn(id);
        }
        for boss in boss_shots {
            if let Err(e) = self.add_shot(boss) {
                warn!(error = %e, "skipping boss shot");
            }
        }
    }

    fn resolve_collisions(&mut self) {
        let monsters: Vec<(EntityId, Vec2, MonsterKind)> = self
            .world
            .entities_with::<Monster>()
            .into_iter()
            .filter_map(|e| {
                let pos = self.world.get::<Position>(e).ok().flatten()?.0;
                let kind = self.world.get::<Monster>(e).ok().flatten()?.kind;
                Some((e, pos, kind))
            })
            .collect();
        let players: Vec<(EntityId, Vec2)> = self
            .world
            .entities_with::<Player>()
            .into_iter()
            .filter_map(|e| Some((e, self.world.get::<Position>(e).ok().flatten()?.0)))
            .collect();
        let bullets: Vec<(EntityId, Vec2, Bullet)> = self
            .world
            .entities_with::<Bullet>()
            .into_iter()
            .filter_map(|e| {
                let pos = self.world.get::<Position>(e).ok().flatten()?.0;
                let bullet = *self.world.get::<Bullet>(e).ok().flatten()?;
                Some((e, pos, bullet))
            })
            .collect();

        let mut spent = Vec::new();

        // Monster contact damage.
        for &(player, ppos) in &players {
            for &(_, mpos, kind) in &monsters {
                let half = if kind == MonsterKind::Boss {
                    BOSS_HALF
                } else {
                    MONSTER_HALF
                };
                if aabb_overlap(mpos, half, ppos, PLAYER_HALF) {
                    self.damage_player(player);
                    break;
                }
            }
        }

        // Hostile bullets versus players.
        for &(bullet, bpos, ref b) in &bullets {
            if !b.hostile {
                continue;
            }
            for &(player, ppos) in &players {
                if aabb_overlap(bpos, BULLET_HALF, ppos, PLAYER_HALF) {
                    self.damage_player(player);
                    spent.push(bullet);
                    break;
                }
            }
        }

        // Player bullets versus monsters.
        for &(bullet, bpos, ref b) in &bullets {
            if b.hostile {
                continue;
            }
            for &(monster, mpos, kind) in &monsters {
                let half = if kind == MonsterKind::Boss {
                    BOSS_HALF
                } else {
                    MONSTER_HALF
                };
                if !aabb_overlap(bpos, BULLET_HALF, mpos, half) {
                    continue;
                }
                let killed = match self.world.get_mut::<Monster>(monster) {
                    Ok(Some(m)) if m.hp > 0 => {
                        m.hp -= b.damage;
                        m.hp <= 0
                    }
                    _ => false,
                };
                if killed {
                    self.credit_kill(b.owner);
                }
                spent.push(bullet);
                break;
            }
        }

        spent.sort_by_key(|e| e.to_bits());
        spent.dedup();
        for bullet in spent {
            let _ = self.world.despawn(bullet);
        }
    }

    fn damage_player(&mut self, entity: EntityId) {
        if let Ok(Some(player)) = self.world.get_mut::<Player>(entity) {
            if player.hp == 0 || player.hit_cooldown > 0.0 {
                return;
            }
            player.hp -= 1;
            player.hit_cooldown = HIT_COOLDOWN;
            debug!(session = %player.session, hp = player.hp, "player hit");
        }
    }

    fn credit_kill(&mut self, owner: EntityId) {
        self.lobby_score = self.lobby_score.saturating_add(KILL_SCORE);
        if let Ok(Some(player)) = self.world.get_mut::<Player>(owner) {
            player.score = player.score.saturating_add(KILL_SCORE);
            let level = (player.score / LEVEL_STEP + 1).min(u8::MAX as u16) as u8;
            if level != player.level {
                player.level = level;
                self.events.push(WorldEvent::LevelUp {
                    session: player.session,
                    level,
                    score: player.score,
                });
            }
        }
    }

    fn reap_dead(&mut self) {
        // Monsters at or below zero health.
        let dead_monsters: Vec<(EntityId, MonsterKind)> = self
            .world
            .iter::<Monster>()
            .filter(|(_, m)| m.hp <= 0)
            .map(|(e, m)| (e, m.kind))
            .collect();
        for (entity, kind) in dead_monsters {
            if kind == MonsterKind::Boss {
                self.boss_defeated.set();
                info!("boss defeated");
            }
            let _ = self.world.despawn(entity);
        }

        // Players at zero health.
        let dead_players: Vec<(EntityId, SessionId)> = self
            .world
            .iter::<Player>()
            .filter(|(_, p)| p.hp == 0)
            .map(|(e, p)| (e, p.session))
            .collect();
        for (entity, session) in dead_players {
            if let Ok(Some(player)) = self.world.get_mut::<Player>(entity) {
                player.alive = false;
            }
            self.events.push(WorldEvent::PlayerDied { session });
            let _ = self.remove_player(entity);
        }
    }

    fn has_boss(&self) -> bool {
        self.world
            .iter::<Monster>()
            .any(|(_, m)| m.kind == MonsterKind::Boss)
    }

    fn spawn_wave(&mut self) {
        if !self.boss_spawned_once && self.lobby_score >= BOSS_SCORE_THRESHOLD {
            self.spawn_boss();
            return;
        }
        if !self.has_boss() && self.time >= self.next_monster_spawn {
            self.spawn_monster();
        }
    }

    fn spawn_monster(&mut self) {
        let kind = if self.rng.gen_bool(0.5) {
            MonsterKind::Sine
        } else {
            MonsterKind::ZigZag
        };
        let base_y = self.rng.gen_range(20.0..235.0);
        let (amplitude, freq, speed_x) = match kind {
            MonsterKind::Sine => (self.rng.gen_range(8.0..18.0), self.rng.gen_range(2.5..5.0), -1.3),
            _ => (22.0, 0.0, -1.4),
        };

        let entity = self.world.spawn();
        let _ = self
            .world
            .insert(entity, Position(Vec2::new(WORLD_MAX, base_y)));
        let _ = self.world.insert(
            entity,
            Monster {
                kind,
                hp: MONSTER_HP,
                base_y,
                amplitude,
                freq,
                phase: 0.0,
                speed_x,
                fire_cooldown: 0.0,
                leg: 0,
                leg_elapsed: 0.0,
            },
        );

        self.next_monster_spawn = self.time + self.rng.gen_range(1.6..2.4);
        debug!(entity = ?entity, kind = ?kind, base_y, "monster spawned");
    }

    fn spawn_boss(&mut self) {
        let entity = self.world.spawn();
        let _ = self
            .world
            .insert(entity, Position(Vec2::new(220.0, 120.0)));
        let _ = self.world.insert(
            entity,
            Monster {
                kind: MonsterKind::Boss,
                hp: BOSS_HP,
                base_y: 120.0,
                amplitude: 0.0,
                freq: 0.0,
                phase: 0.0,
                speed_x: 0.0,
                fire_cooldown: BOSS_FIRE_INTERVAL,
                leg: 0,
                leg_elapsed: 0.0,
            },
        );
        self.boss_spawned_once = true;
        self.boss_spawned.set();
        info!(entity = ?entity, "boss spawned");
    }

    /// Serializes the full current world into one SNAPSHOT packet. Always a
    /// full-state broadcast, never a diff.
    pub fn build_snapshot_packet(&self) -> Packet {
        let mut snapshot = Snapshot {
            tick: self.tick,
            ..Snapshot::default()
        };

        for entity in self.world.entities_with::<Player>() {
            let (Ok(Some(player)), Ok(Some(pos))) = (
                self.world.get::<Player>(entity),
                self.world.get::<Position>(entity),
            ) else {
                continue;
            };
            snapshot.players.push(PlayerSnap {
                entity: entity.to_bits(),
                session: player.session,
                pos: pos.0,
                hp: player.hp,
                level: player.level,
                score: player.score,
            });
        }

        for entity in self.world.entities_with::<Bullet>() {
            let (Ok(Some(bullet)), Ok(Some(pos)), Ok(Some(vel))) = (
                self.world.get::<Bullet>(entity),
                self.world.get::<Position>(entity),
                self.world.get::<Velocity>(entity),
            ) else {
                continue;
            };
            snapshot.bullets.push(BulletSnap {
                entity: entity.to_bits(),
                pos: pos.0,
                vel: vel.0,
                hostile: bullet.hostile,
            });
        }

        for entity in self.world.entities_with::<Monster>() {
            let (Ok(Some(monster)), Ok(Some(pos))) = (
                self.world.get::<Monster>(entity),
                self.world.get::<Position>(entity),
            ) else {
                continue;
            };
            snapshot.monsters.push(MonsterSnap {
                entity: entity.to_bits(),
                pos: pos.0,
                kind: monster.kind,
                hp: monster.hp.clamp(0, u8::MAX as i16) as u8,
            });
        }

        Packet::Snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 30.0;

    fn world() -> GameWorld {
        GameWorld::new(7, 4)
    }

    #[test]
    fn register_and_remove_track_counts() {
        let mut w = world();
        let a = w.register_player(SessionId(1)).unwrap();
        let b = w.register_player(SessionId(2)).unwrap();
        assert_eq!(w.player_count(), 2);
        assert_eq!(w.phase(), LobbyPhase::Active);

        w.remove_player(a).unwrap();
        assert_eq!(w.player_count(), 1);
        w.remove_player(b).unwrap();
        assert_eq!(w.player_count(), 0);

        // Removing again fails loudly, not silently.
        assert!(w.remove_player(a).is_err());
    }

    #[test]
    fn capacity_refused_without_state_change() {
        let mut w = GameWorld::new(7, 1);
        w.register_player(SessionId(1)).unwrap();
        assert_eq!(w.register_player(SessionId(2)), Err(CapacityExceeded));
        assert_eq!(w.player_count(), 1);
    }

    #[test]
    fn no_players_latch_fires_once_per_transition() {
        let mut w = world();
        assert!(!w.take_no_players());

        let a = w.register_player(SessionId(1)).unwrap();
        w.remove_player(a).unwrap();
        assert_eq!(w.phase(), LobbyPhase::Draining);
        assert!(w.take_no_players());
        assert!(!w.take_no_players());

        // A fresh join and leave raises a fresh edge.
        let b = w.register_player(SessionId(2)).unwrap();
        assert_eq!(w.phase(), LobbyPhase::Active);
        w.remove_player(b).unwrap();
        assert!(w.take_no_players());
        assert!(!w.take_no_players());
    }

    #[test]
    fn input_moves_player_by_velocity_dt_for_one_tick() {
        let mut w = world();
        let p = w.register_player(SessionId(1)).unwrap();
        let start = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.players[0].pos,
            _ => unreachable!(),
        };

        w.update_input(p, Buttons::RIGHT).unwrap();
        w.tick(DT);
        let after_one = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.players[0].pos,
            _ => unreachable!(),
        };
        assert!((after_one.x - start.x - PLAYER_SPEED * DT).abs() < 1e-4);

        // No queuing across ticks: the input was consumed.
        w.tick(DT);
        let after_two = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.players[0].pos,
            _ => unreachable!(),
        };
        assert!((after_two.x - after_one.x).abs() < 1e-4);
    }

    #[test]
    fn last_writer_wins_within_a_tick() {
        let mut w = world();
        let p = w.register_player(SessionId(1)).unwrap();
        w.update_input(p, Buttons::LEFT).unwrap();
        w.update_input(p, Buttons::RIGHT).unwrap();
        let x0 = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.players[0].pos.x,
            _ => unreachable!(),
        };
        w.tick(DT);
        let x1 = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.players[0].pos.x,
            _ => unreachable!(),
        };
        assert!(x1 > x0);
    }

    #[test]
    fn shoot_spawns_bullet_moving_away_from_owner() {
        let mut w = world();
        let p = w.register_player(SessionId(1)).unwrap();
        w.add_shot(p).unwrap();
        assert_eq!(w.bullet_count(), 1);

        w.tick(DT);
        let snap = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s,
            _ => unreachable!(),
        };
        let bullet = snap.bullets[0];
        assert!(!bullet.hostile);
        assert!(bullet.vel.x > 0.0);
        assert!(bullet.pos.x > snap.players[0].pos.x);
    }

    #[test]
    fn boss_spawns_exactly_once_at_threshold() {
        let mut w = world();
        w.register_player(SessionId(1)).unwrap();
        assert!(!w.take_boss_spawned());

        // Crossing the threshold triggers the boss on the next tick.
        w.lobby_score = BOSS_SCORE_THRESHOLD;
        w.tick(DT);
        assert!(w.take_boss_spawned());
        assert!(!w.take_boss_spawned());
        assert!(w.has_boss());

        // Further ticks do not retrigger.
        for _ in 0..10 {
            w.tick(DT);
        }
        assert!(!w.take_boss_spawned());
    }

    #[test]
    fn boss_death_latches_defeated() {
        let mut w = world();
        w.register_player(SessionId(1)).unwrap();
        w.lobby_score = BOSS_SCORE_THRESHOLD;
        w.tick(DT);
        assert!(w.take_boss_spawned());

        let boss = w
            .world
            .iter::<Monster>()
            .find(|(_, m)| m.kind == MonsterKind::Boss)
            .map(|(e, _)| e)
            .unwrap();
        if let Ok(Some(m)) = w.world.get_mut::<Monster>(boss) {
            m.hp = 0;
        }
        w.tick(DT);
        assert!(w.take_boss_defeated());
        assert!(!w.take_boss_defeated());
        assert!(!w.has_boss());
    }

    #[test]
    fn monsters_spawn_over_time_and_drift_left() {
        let mut w = world();
        w.register_player(SessionId(1)).unwrap();
        for _ in 0..120 {
            w.tick(DT);
        }
        assert!(w.monster_count() > 0);
        let snap = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s,
            _ => unreachable!(),
        };
        assert!(snap.monsters.iter().all(|m| m.pos.x < WORLD_MAX));
    }

    #[test]
    fn snapshot_is_full_state() {
        let mut w = world();
        w.register_player(SessionId(1)).unwrap();
        w.register_player(SessionId(2)).unwrap();
        let p = w.player_entity(SessionId(1)).unwrap();
        w.add_shot(p).unwrap();

        let snap = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s,
            _ => unreachable!(),
        };
        assert_eq!(snap.players.len(), 2);
        assert_eq!(snap.bullets.len(), 1);
    }

    #[test]
    fn closed_world_ignores_ticks() {
        let mut w = world();
        w.register_player(SessionId(1)).unwrap();
        w.close();
        let before = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.tick,
            _ => unreachable!(),
        };
        w.tick(DT);
        let after = match w.build_snapshot_packet() {
            Packet::Snapshot(s) => s.tick,
            _ => unreachable!(),
        };
        assert_eq!(before, after);
    }
}
