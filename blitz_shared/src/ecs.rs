//! Entity/component storage (minimal ECS).
//!
//! A deliberately small ECS suitable for deterministic simulation and net
//! replication. It is not archetype-based; typed component storages are keyed
//! by `TypeId` and downcast at the access boundary.
//!
//! Entity handles carry a generation: despawned slots are recycled with the
//! generation bumped, so a stale handle fails with [`InvalidHandle`] instead
//! of silently aliasing a new entity.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::input::Buttons;
use crate::math::Vec2;

/// Opaque entity handle: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    slot: u16,
    generation: u16,
}

impl EntityId {
    /// Packs the handle for the wire (`generation << 16 | slot`).
    pub fn to_bits(self) -> u32 {
        (self.generation as u32) << 16 | self.slot as u32
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            slot: bits as u16,
            generation: (bits >> 16) as u16,
        }
    }

    pub fn slot(self) -> u16 {
        self.slot
    }
}

/// A destroyed or never-created handle was passed to an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHandle(pub EntityId);

impl fmt::Display for InvalidHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entity handle {:#010x}", self.0.to_bits())
    }
}

impl std::error::Error for InvalidHandle {}

/// Type-erased storage so `despawn` can clear every component of an entity
/// without knowing the component types.
trait ComponentStorage: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clear_entity(&mut self, entity: EntityId);
}

struct Storage<T> {
    map: HashMap<EntityId, T>,
}

impl<T: 'static + Send + Sync> ComponentStorage for Storage<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clear_entity(&mut self, entity: EntityId) {
        self.map.remove(&entity);
    }
}

/// World of entities with typed components.
#[derive(Default)]
pub struct World {
    generations: Vec<u16>,
    alive: Vec<bool>,
    free: Vec<u16>,
    storages: HashMap<TypeId, Box<dyn ComponentStorage>>,
    live: usize,
}

impl World {
    /// Creates a new entity.
    pub fn spawn(&mut self) -> EntityId {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.alive[slot as usize] = true;
                slot
            }
            None => {
                self.generations.push(0);
                self.alive.push(true);
                (self.generations.len() - 1) as u16
            }
        };
        self.live += 1;
        EntityId {
            slot,
            generation: self.generations[slot as usize],
        }
    }

    /// Destroys an entity and every component attached to it. O(1) amortized
    /// per registered component type.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), InvalidHandle> {
        self.check(entity)?;
        for storage in self.storages.values_mut() {
            storage.clear_entity(entity);
        }
        let i = entity.slot as usize;
        self.alive[i] = false;
        self.generations[i] = self.generations[i].wrapping_add(1);
        self.free.push(entity.slot);
        self.live -= 1;
        Ok(())
    }

    /// Whether the handle refers to a live entity.
    pub fn contains(&self, entity: EntityId) -> bool {
        let i = entity.slot as usize;
        i < self.generations.len() && self.alive[i] && self.generations[i] == entity.generation
    }

    fn check(&self, entity: EntityId) -> Result<(), InvalidHandle> {
        if self.contains(entity) {
            Ok(())
        } else {
            Err(InvalidHandle(entity))
        }
    }

    fn storage<T: 'static + Send + Sync>(&self) -> Option<&Storage<T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<Storage<T>>())
    }

    fn storage_mut<T: 'static + Send + Sync>(&mut self) -> Option<&mut Storage<T>> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<Storage<T>>())
    }

    /// Inserts/replaces a component for an entity.
    pub fn insert<T: 'static + Send + Sync>(
        &mut self,
        entity: EntityId,
        component: T,
    ) -> Result<(), InvalidHandle> {
        self.check(entity)?;
        let storage = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                Box::new(Storage::<T> {
                    map: HashMap::new(),
                })
            })
            .as_any_mut()
            .downcast_mut::<Storage<T>>()
            .expect("storage type mismatch");
        storage.map.insert(entity, component);
        Ok(())
    }

    /// Gets a component reference. `Ok(None)` means the entity is live but
    /// lacks that capability.
    pub fn get<T: 'static + Send + Sync>(
        &self,
        entity: EntityId,
    ) -> Result<Option<&T>, InvalidHandle> {
        self.check(entity)?;
        Ok(self.storage::<T>().and_then(|s| s.map.get(&entity)))
    }

    /// Gets a mutable component reference.
    pub fn get_mut<T: 'static + Send + Sync>(
        &mut self,
        entity: EntityId,
    ) -> Result<Option<&mut T>, InvalidHandle> {
        self.check(entity)?;
        Ok(self.storage_mut::<T>().and_then(|s| s.map.get_mut(&entity)))
    }

    /// Removes a component from an entity, returning it.
    pub fn remove<T: 'static + Send + Sync>(
        &mut self,
        entity: EntityId,
    ) -> Result<Option<T>, InvalidHandle> {
        self.check(entity)?;
        Ok(self.storage_mut::<T>().and_then(|s| s.map.remove(&entity)))
    }

    /// Iterates entities with a given component. Order is stable while the
    /// world is not mutated; use [`World::entities_with`] for deterministic
    /// passes.
    pub fn iter<T: 'static + Send + Sync>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storage::<T>()
            .into_iter()
            .flat_map(|s| s.map.iter().map(|(k, v)| (*k, v)))
    }

    /// Iterates mutably over entities with a given component.
    pub fn iter_mut<T: 'static + Send + Sync>(
        &mut self,
    ) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.storage_mut::<T>()
            .into_iter()
            .flat_map(|s| s.map.iter_mut().map(|(k, v)| (*k, v)))
    }

    /// Live entities holding `T`, sorted by slot for stable iteration.
    pub fn entities_with<T: 'static + Send + Sync>(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.iter::<T>().map(|(e, _)| e).collect();
        ids.sort_by_key(|e| e.slot);
        ids
    }

    /// Number of entities holding `T`.
    pub fn count<T: 'static + Send + Sync>(&self) -> usize {
        self.storage::<T>().map_or(0, |s| s.map.len())
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// Common component: position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position(pub Vec2);

/// Common component: velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity(pub Vec2);

/// Pending input bitmask, consumed once per tick by the input pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputController {
    pub buttons: Buttons,
}

/// Advances `Position` by `Velocity * dt` for every entity holding both.
pub fn movement_pass(world: &mut World, dt: f32) {
    for id in world.entities_with::<Velocity>() {
        let vel = match world.get::<Velocity>(id) {
            Ok(Some(v)) => v.0,
            _ => continue,
        };
        if let Ok(Some(pos)) = world.get_mut::<Position>(id) {
            pos.0 = pos.0.add(vel.scale(dt));
        }
    }
}

/// Maps each pending input bitmask to a velocity, clears the bitmask, and
/// returns the entities that had SHOOT pressed.
pub fn input_pass(world: &mut World, speed: f32) -> Vec<EntityId> {
    let mut shooters = Vec::new();
    for id in world.entities_with::<InputController>() {
        let buttons = match world.get_mut::<InputController>(id) {
            Ok(Some(ctl)) => std::mem::take(&mut ctl.buttons),
            _ => continue,
        };
        if let Ok(Some(vel)) = world.get_mut::<Velocity>(id) {
            vel.0 = buttons.axis().scale(speed);
        }
        if buttons.contains(Buttons::SHOOT) {
            shooters.push(id);
        }
    }
    shooters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Position(Vec2::new(1.0, 2.0))).unwrap();
        assert_eq!(world.get::<Position>(e).unwrap().unwrap().0.x, 1.0);
        assert_eq!(world.get::<Velocity>(e).unwrap(), None);
    }

    #[test]
    fn stale_handle_fails_after_slot_reuse() {
        let mut world = World::default();
        let a = world.spawn();
        world.insert(a, Position(Vec2::new(5.0, 5.0))).unwrap();
        world.despawn(a).unwrap();

        let b = world.spawn();
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a, b);

        assert_eq!(world.get::<Position>(a), Err(InvalidHandle(a)));
        assert_eq!(world.despawn(a), Err(InvalidHandle(a)));
        // The recycled slot starts clean.
        assert_eq!(world.get::<Position>(b).unwrap(), None);
    }

    #[test]
    fn despawn_clears_all_components() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Position(Vec2::ZERO)).unwrap();
        world.insert(e, Velocity(Vec2::new(1.0, 0.0))).unwrap();
        world.despawn(e).unwrap();
        assert_eq!(world.count::<Position>(), 0);
        assert_eq!(world.count::<Velocity>(), 0);
        assert!(world.is_empty());
    }

    #[test]
    fn live_count_tracks_spawns_and_despawns() {
        let mut world = World::default();
        let ids: Vec<_> = (0..4).map(|_| world.spawn()).collect();
        assert_eq!(world.len(), 4);
        world.despawn(ids[1]).unwrap();
        world.despawn(ids[3]).unwrap();
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn movement_pass_advances_by_velocity_dt() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Position(Vec2::new(10.0, 20.0))).unwrap();
        world.insert(e, Velocity(Vec2::new(80.0, -40.0))).unwrap();

        movement_pass(&mut world, 0.5);

        let pos = world.get::<Position>(e).unwrap().unwrap().0;
        assert_eq!(pos, Vec2::new(50.0, 0.0));
    }

    #[test]
    fn input_pass_sets_velocity_and_clears_buttons() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Position(Vec2::ZERO)).unwrap();
        world.insert(e, Velocity(Vec2::ZERO)).unwrap();
        world
            .insert(
                e,
                InputController {
                    buttons: Buttons::RIGHT | Buttons::SHOOT,
                },
            )
            .unwrap();

        let shooters = input_pass(&mut world, 80.0);
        assert_eq!(shooters, vec![e]);
        assert_eq!(
            world.get::<Velocity>(e).unwrap().unwrap().0,
            Vec2::new(80.0, 0.0)
        );
        assert_eq!(
            world.get::<InputController>(e).unwrap().unwrap().buttons,
            Buttons::empty()
        );

        // Second pass sees no pending input.
        let shooters = input_pass(&mut world, 80.0);
        assert!(shooters.is_empty());
        assert_eq!(world.get::<Velocity>(e).unwrap().unwrap().0, Vec2::ZERO);
    }
}
