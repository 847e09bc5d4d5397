//! The simulated world, as seen by the netcode
//!
//! The tick loop never touches entity state directly: it goes through the
//! [`World`] trait. [`ArenaWorld`] is a small top-down arena used by the
//! server binary and the tests.

use crate::lag::Shot;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::control::Control;
use shared::geometry::{ArenaBounds, StaticGeometry, Vector2};
use shared::snapshot::{EntityDesc, EntityKind};
use shared::{ArenaLayout, EntityId, IdAllocator, MAX_N_WEAPONS};
use std::collections::BTreeMap;

/// Collaborator driving entity state
pub trait World {
    /// Spawns an entity for a new session
    fn spawn(&mut self, name: &str, kind: EntityKind, ids: &mut IdAllocator) -> EntityId;

    /// Removes an entity; its id is reported by the next capture
    fn despawn(&mut self, id: EntityId);

    fn entity(&self, id: EntityId) -> Option<EntityDesc>;

    /// Current state of every entity
    fn entities(&self) -> Vec<EntityDesc>;

    /// Applies one control to one entity, returning the shot it fires, if any
    fn apply_control(&mut self, id: EntityId, control: &Control) -> Option<Shot>;

    /// Entities and the ids despawned since the previous capture
    fn capture(&mut self) -> (Vec<EntityDesc>, Vec<EntityId>);

    fn hurt(&mut self, id: EntityId, damage: f32);

    fn geometry(&self) -> &dyn StaticGeometry;

    /// Blobs streamed to clients over the bulk channel
    fn static_payloads(&self) -> Vec<Vec<u8>>;
}

pub const PLAYER_RADIUS: f32 = 9.0;
pub const PLAYER_HEALTH: f32 = 100.0;
/// Distance covered per applied control
pub const PLAYER_SPEED: f32 = 3.0;
pub const RUN_FACTOR: f32 = 1.5;
const SPAWN_JITTER: f32 = 20.0;

/// Range and damage per weapon slot
pub const WEAPONS: [(f32, f32); MAX_N_WEAPONS] = [(400.0, 10.0), (150.0, 35.0), (800.0, 60.0), (60.0, 20.0)];

pub struct ArenaWorld {
    bounds: ArenaBounds,
    spawn_points: Vec<Vector2>,
    entities: BTreeMap<EntityId, EntityDesc>,
    despawned: Vec<EntityId>,
    rng: StdRng,
}

impl ArenaWorld {
    pub fn new(width: f32, height: f32) -> Self {
        let spawn_points = vec![
            Vector2::new(width * 0.25, height * 0.25),
            Vector2::new(width * 0.75, height * 0.25),
            Vector2::new(width * 0.25, height * 0.75),
            Vector2::new(width * 0.75, height * 0.75),
        ];
        Self {
            bounds: ArenaBounds { width, height },
            spawn_points,
            entities: BTreeMap::new(),
            despawned: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_spawn_points(mut self, spawn_points: Vec<Vector2>) -> Self {
        if !spawn_points.is_empty() {
            self.spawn_points = spawn_points;
        }
        self
    }

    pub fn layout(&self) -> ArenaLayout {
        ArenaLayout {
            width: self.bounds.width,
            height: self.bounds.height,
            spawn_points: self.spawn_points.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Top-left corner of a fresh entity near a random spawn point
    fn spawn_position(&mut self) -> (f32, f32) {
        let i = self.rng.gen_range(0..self.spawn_points.len());
        let point = self.spawn_points[i];
        let x = point.x + self.rng.gen_range(-SPAWN_JITTER..SPAWN_JITTER);
        let y = point.y + self.rng.gen_range(-SPAWN_JITTER..SPAWN_JITTER);
        self.clamp(x - PLAYER_RADIUS, y - PLAYER_RADIUS)
    }

    fn clamp(&self, x: f32, y: f32) -> (f32, f32) {
        let max_x = (self.bounds.width - 2.0 * PLAYER_RADIUS).max(0.0);
        let max_y = (self.bounds.height - 2.0 * PLAYER_RADIUS).max(0.0);
        (x.clamp(0.0, max_x), y.clamp(0.0, max_y))
    }
}

impl Default for ArenaWorld {
    fn default() -> Self {
        Self::new(800.0, 600.0)
    }
}

impl World for ArenaWorld {
    fn spawn(&mut self, name: &str, kind: EntityKind, ids: &mut IdAllocator) -> EntityId {
        let id = ids.fresh();
        let (x, y) = self.spawn_position();
        self.entities.insert(
            id,
            EntityDesc {
                id,
                kind,
                name: name.to_string(),
                health: PLAYER_HEALTH,
                max_health: PLAYER_HEALTH,
                x,
                y,
                radius: PLAYER_RADIUS,
                velocity: PLAYER_SPEED,
                facing_angle: 0.0,
                weapons: (0..MAX_N_WEAPONS as i32).collect(),
                weapon_index: 0,
            },
        );
        info!("spawned {} '{}' at ({:.1}, {:.1})", id, name, x, y);
        id
    }

    fn despawn(&mut self, id: EntityId) {
        if self.entities.remove(&id).is_some() {
            info!("despawned {}", id);
            self.despawned.push(id);
        }
    }

    fn entity(&self, id: EntityId) -> Option<EntityDesc> {
        self.entities.get(&id).cloned()
    }

    fn entities(&self) -> Vec<EntityDesc> {
        self.entities.values().cloned().collect()
    }

    fn apply_control(&mut self, id: EntityId, control: &Control) -> Option<Shot> {
        let entity = self.entities.get(&id)?;

        let mut dx = 0.0;
        let mut dy = 0.0;
        if control.up() {
            dy -= 1.0;
        }
        if control.down() {
            dy += 1.0;
        }
        if control.left() {
            dx -= 1.0;
        }
        if control.right() {
            dx += 1.0;
        }

        let step = Vector2::new(dx, dy).normalize();
        let speed = if control.run {
            entity.velocity * RUN_FACTOR
        } else {
            entity.velocity
        };
        let (x, y) = self.clamp(entity.x + step.x * speed, entity.y + step.y * speed);

        let entity = self.entities.get_mut(&id)?;
        entity.x = x;
        entity.y = y;
        entity.facing_angle = control.facing_angle;
        if let Some(slot) = control.weapon_change {
            if (slot as usize) < entity.weapons.len() {
                entity.weapon_index = slot as i32;
            }
        }

        if !control.shoot {
            return None;
        }
        let weapon = entity
            .weapons
            .get(entity.weapon_index as usize)
            .and_then(|w| WEAPONS.get(*w as usize))?;
        Some(Shot {
            shooter: id,
            origin: entity.center(),
            angle: control.facing_angle,
            range: weapon.0,
            damage: weapon.1,
        })
    }

    fn capture(&mut self) -> (Vec<EntityDesc>, Vec<EntityId>) {
        (self.entities(), std::mem::take(&mut self.despawned))
    }

    fn hurt(&mut self, id: EntityId, damage: f32) {
        let killed = match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.health -= damage;
                entity.health <= 0.0
            }
            None => return,
        };

        if killed {
            let (x, y) = self.spawn_position();
            if let Some(entity) = self.entities.get_mut(&id) {
                info!("{} '{}' was killed, respawning", id, entity.name);
                entity.health = entity.max_health;
                entity.x = x;
                entity.y = y;
            }
        }
    }

    fn geometry(&self) -> &dyn StaticGeometry {
        &self.bounds
    }

    fn static_payloads(&self) -> Vec<Vec<u8>> {
        match self.layout().to_bytes() {
            Ok(bytes) => vec![bytes],
            Err(e) => {
                log::error!("cannot serialize arena layout: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::control::{MOVE_LEFT, MOVE_RIGHT, MOVE_UP};

    fn world_with_player() -> (ArenaWorld, EntityId) {
        let mut world = ArenaWorld::new(800.0, 600.0).with_spawn_points(vec![Vector2::new(400.0, 300.0)]);
        let mut ids = IdAllocator::new();
        let id = world.spawn("alice", EntityKind::Player, &mut ids);
        (world, id)
    }

    #[test]
    fn test_spawn_near_spawn_point() {
        let (world, id) = world_with_player();
        let center = world.entity(id).unwrap().center();
        assert!((center.x - 400.0).abs() <= SPAWN_JITTER);
        assert!((center.y - 300.0).abs() <= SPAWN_JITTER);
    }

    #[test]
    fn test_apply_control_moves_and_turns() {
        let (mut world, id) = world_with_player();
        let before = world.entity(id).unwrap();

        let control = Control {
            movement: MOVE_RIGHT,
            facing_angle: 1.0,
            ..Control::new(1)
        };
        assert!(world.apply_control(id, &control).is_none());

        let after = world.entity(id).unwrap();
        assert_approx_eq!(after.x - before.x, PLAYER_SPEED, 1e-4);
        assert_approx_eq!(after.y, before.y, 1e-4);
        assert_eq!(after.facing_angle, 1.0);
    }

    #[test]
    fn test_opposite_directions_cancel() {
        let (mut world, id) = world_with_player();
        let before = world.entity(id).unwrap();

        let control = Control {
            movement: MOVE_LEFT | MOVE_RIGHT | MOVE_UP,
            run: true,
            ..Control::new(1)
        };
        world.apply_control(id, &control);

        let after = world.entity(id).unwrap();
        assert_approx_eq!(after.x, before.x, 1e-4);
        assert_approx_eq!(before.y - after.y, PLAYER_SPEED * RUN_FACTOR, 1e-4);
    }

    #[test]
    fn test_movement_is_clamped_to_arena() {
        let mut world = ArenaWorld::new(100.0, 100.0).with_spawn_points(vec![Vector2::new(10.0, 10.0)]);
        let mut ids = IdAllocator::new();
        let id = world.spawn("bob", EntityKind::Player, &mut ids);

        for tick in 0..100 {
            let control = Control {
                movement: MOVE_LEFT | MOVE_UP,
                ..Control::new(tick)
            };
            world.apply_control(id, &control);
        }
        let entity = world.entity(id).unwrap();
        assert_eq!((entity.x, entity.y), (0.0, 0.0));
    }

    #[test]
    fn test_shoot_with_selected_weapon() {
        let (mut world, id) = world_with_player();
        let control = Control {
            shoot: true,
            weapon_change: Some(2),
            facing_angle: 0.5,
            ..Control::new(1)
        };
        let shot = world.apply_control(id, &control).unwrap();

        assert_eq!(shot.shooter, id);
        assert_eq!(shot.angle, 0.5);
        assert_eq!((shot.range, shot.damage), WEAPONS[2]);
        assert_eq!(shot.origin, world.entity(id).unwrap().center());
    }

    #[test]
    fn test_despawn_reported_once() {
        let (mut world, id) = world_with_player();
        world.despawn(id);
        world.despawn(id);

        let (entities, despawned) = world.capture();
        assert!(entities.is_empty());
        assert_eq!(despawned, vec![id]);
        assert!(world.capture().1.is_empty());
    }

    #[test]
    fn test_lethal_damage_respawns() {
        let (mut world, id) = world_with_player();
        world.hurt(id, 30.0);
        assert_eq!(world.entity(id).unwrap().health, 70.0);

        world.hurt(id, 80.0);
        assert_eq!(world.entity(id).unwrap().health, PLAYER_HEALTH);
    }

    #[test]
    fn test_static_payload_is_layout() {
        let world = ArenaWorld::default();
        let payloads = world.static_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(ArenaLayout::from_bytes(&payloads[0]).unwrap(), world.layout());
    }
}
