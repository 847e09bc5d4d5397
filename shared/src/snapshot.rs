//! World-state captures and their per-recipient wire encoding
//!
//! A snapshot message is tailored to its recipient: the recipient's own
//! entity is written first in its full form (with velocity), everybody
//! else follows in the short form (with entity kind). Entities a wall hides
//! from the recipient are left out.
//!
//! ```text
//! [id: u32][tick: u32][client tick: u32]
//! [own entity (full) | NO_ENTITY: u32]
//! [count: u32][entity (short)]*
//! [count: u32][despawned id: u32]*
//! ```

use crate::frame::{FrameError, FrameReader, WireFrame};
use crate::geometry::{StaticGeometry, Vector2};
use crate::{opcode, EntityId, SnapshotId, Tick, ACK_SIZE, MAX_N_WEAPONS, NAME_SIZE, NO_ENTITY};

/// Marks an empty weapon slot on the wire
pub const NO_WEAPON: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityKind {
    Entity = 0,
    ControlledEntity = 1,
    Player = 2,
}

impl From<u8> for EntityKind {
    fn from(value: u8) -> Self {
        match value {
            1 => EntityKind::ControlledEntity,
            2 => EntityKind::Player,
            _ => EntityKind::Entity,
        }
    }
}

/// The synchronised part of one entity's state at one tick
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDesc {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    pub health: f32,
    pub max_health: f32,
    /// Top-left corner of the entity's bounding square
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub velocity: f32,
    pub facing_angle: f32,
    pub weapons: Vec<i32>,
    /// Index of the equipped weapon amongst `weapons`
    pub weapon_index: i32,
}

impl EntityDesc {
    pub fn center(&self) -> Vector2 {
        Vector2::new(self.x + self.radius, self.y + self.radius)
    }

    /// Appends this entity; `full` selects the recipient's own-entity form
    pub fn write(&self, frame: &mut WireFrame, full: bool) -> Result<(), FrameError> {
        frame.append_u32(self.id)?;
        if !full {
            frame.append_u8(self.kind as u8)?;
        }

        let name: String = self.name.chars().take(NAME_SIZE - 1).collect();
        frame.append_str(&name)?;
        frame.append_f32(self.health)?;
        frame.append_f32(self.max_health)?;
        frame.append_f32(self.x)?;
        frame.append_f32(self.y)?;
        frame.append_f32(self.radius)?;
        frame.append_f32(self.facing_angle)?;
        if full {
            frame.append_f32(self.velocity)?;
        }

        for i in 0..MAX_N_WEAPONS {
            frame.append_i32(self.weapons.get(i).copied().unwrap_or(NO_WEAPON))?;
        }
        frame.append_i32(self.weapon_index)
    }

    /// Reads an entity whose id has already been consumed
    fn read_body(id: EntityId, reader: &mut FrameReader<'_>, full: bool) -> Result<Self, FrameError> {
        let kind = if full {
            EntityKind::Player
        } else {
            EntityKind::from(reader.read_u8()?)
        };

        let name = reader.read_str()?;
        let health = reader.read_f32()?;
        let max_health = reader.read_f32()?;
        let x = reader.read_f32()?;
        let y = reader.read_f32()?;
        let radius = reader.read_f32()?;
        let facing_angle = reader.read_f32()?;
        let velocity = if full { reader.read_f32()? } else { 0.0 };

        let mut weapons = Vec::with_capacity(MAX_N_WEAPONS);
        for _ in 0..MAX_N_WEAPONS {
            let weapon = reader.read_i32()?;
            if weapon != NO_WEAPON {
                weapons.push(weapon);
            }
        }
        let weapon_index = reader.read_i32()?;

        Ok(Self {
            id,
            kind,
            name,
            health,
            max_health,
            x,
            y,
            radius,
            velocity,
            facing_angle,
            weapons,
            weapon_index,
        })
    }
}

/// Immutable capture of the world at one server tick
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub tick: Tick,
    pub entities: Vec<EntityDesc>,
    pub despawned: Vec<EntityId>,
}

impl Snapshot {
    pub fn entity(&self, id: EntityId) -> Option<&EntityDesc> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Appends the snapshot body as seen by `recipient`
    pub fn write(
        &self,
        frame: &mut WireFrame,
        recipient: Option<EntityId>,
        client_tick: Tick,
        geometry: &dyn StaticGeometry,
    ) -> Result<(), FrameError> {
        frame.append_u32(self.id)?;
        frame.append_u32(self.tick)?;
        frame.append_u32(client_tick)?;

        let own = recipient.and_then(|id| self.entity(id));
        match own {
            Some(desc) => desc.write(frame, true)?,
            None => frame.append_u32(NO_ENTITY)?,
        }

        let count_offset = frame.payload_len();
        frame.append_u32(0)?;
        let mut count = 0u32;
        for desc in &self.entities {
            if Some(desc.id) == recipient {
                continue;
            }
            if matches!(own, Some(viewer) if occluded(geometry, viewer, desc)) {
                continue;
            }
            desc.write(frame, false)?;
            count += 1;
        }
        frame.patch_u32(count_offset, count)?;

        frame.append_u32(self.despawned.len() as u32)?;
        for id in &self.despawned {
            frame.append_u32(*id)?;
        }
        Ok(())
    }

    /// Encodes a complete `SNAPSHOT` message for one recipient
    pub fn encode_for(
        &self,
        recipient: Option<EntityId>,
        client_tick: Tick,
        geometry: &dyn StaticGeometry,
    ) -> Result<WireFrame, FrameError> {
        let mut frame = WireFrame::new(opcode::SNAPSHOT);
        self.write(&mut frame, recipient, client_tick, geometry)?;
        Ok(frame)
    }
}

/// Whether a wall lies on the line between the centers of `viewer` and `other`
fn occluded(geometry: &dyn StaticGeometry, viewer: &EntityDesc, other: &EntityDesc) -> bool {
    let origin = viewer.center();
    let offset = other.center().sub(&origin);
    let distance = offset.magnitude();
    if distance == 0.0 {
        return false;
    }
    let angle = offset.y.atan2(offset.x);
    geometry.wall_distance(origin, angle, distance) < distance
}

/// A snapshot as decoded by its recipient
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotView {
    pub id: SnapshotId,
    pub tick: Tick,
    pub client_tick: Tick,
    pub own: Option<EntityDesc>,
    pub others: Vec<EntityDesc>,
    pub despawned: Vec<EntityId>,
}

impl SnapshotView {
    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self, FrameError> {
        let id = reader.read_u32()?;
        let tick = reader.read_u32()?;
        let client_tick = reader.read_u32()?;

        let own_id = reader.read_u32()?;
        let own = if own_id == NO_ENTITY {
            None
        } else {
            Some(EntityDesc::read_body(own_id, reader, true)?)
        };

        let count = reader.read_u32()?;
        let mut others = Vec::new();
        for _ in 0..count {
            let id = reader.read_u32()?;
            others.push(EntityDesc::read_body(id, reader, false)?);
        }

        let count = reader.read_u32()?;
        let mut despawned = Vec::new();
        for _ in 0..count {
            despawned.push(reader.read_u32()?);
        }

        Ok(Self {
            id,
            tick,
            client_tick,
            own,
            others,
            despawned,
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        Self::read(&mut FrameReader::new(payload))
    }
}

/// Session parameters sent once, in reply to a configuration request
#[derive(Debug, Clone, PartialEq)]
pub struct WorldConfig {
    pub client_rate: u8,
    pub server_rate: u8,
    pub ack_size: u8,
}

impl WorldConfig {
    pub fn new(client_rate: u8, server_rate: u8) -> Self {
        Self {
            client_rate,
            server_rate,
            ack_size: ACK_SIZE as u8,
        }
    }

    /// Encodes a `CONFIG` message carrying the recipient's initial snapshot
    pub fn encode(
        &self,
        initial: &Snapshot,
        recipient: Option<EntityId>,
        client_tick: Tick,
        geometry: &dyn StaticGeometry,
    ) -> Result<WireFrame, FrameError> {
        let mut frame = WireFrame::new(opcode::CONFIG);
        frame.append_u8(self.client_rate)?;
        frame.append_u8(self.server_rate)?;
        frame.append_u8(self.ack_size)?;
        initial.write(&mut frame, recipient, client_tick, geometry)?;
        Ok(frame)
    }

    pub fn decode(payload: &[u8]) -> Result<(Self, SnapshotView), FrameError> {
        let mut reader = FrameReader::new(payload);
        let config = Self {
            client_rate: reader.read_u8()?,
            server_rate: reader.read_u8()?,
            ack_size: reader.read_u8()?,
        };
        let snapshot = SnapshotView::read(&mut reader)?;
        Ok((config, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_FRAME_SIZE;
    use crate::geometry::{ArenaBounds, OpenField};

    /// A vertical wall at `x`
    struct WallAt(f32);

    impl StaticGeometry for WallAt {
        fn wall_distance(&self, origin: Vector2, angle: f32, range: f32) -> f32 {
            let dir = Vector2::from_angle(angle);
            if dir.x <= 0.0 || origin.x > self.0 {
                return range;
            }
            ((self.0 - origin.x) / dir.x).min(range)
        }
    }

    fn desc(id: EntityId, name: &str, x: f32) -> EntityDesc {
        EntityDesc {
            id,
            kind: EntityKind::Player,
            name: name.to_string(),
            health: 80.0,
            max_health: 100.0,
            x,
            y: 20.0,
            radius: 9.0,
            velocity: 5.0,
            facing_angle: 0.5,
            weapons: vec![3],
            weapon_index: 0,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            id: 4,
            tick: 120,
            entities: vec![desc(1, "alice", 10.0), desc(2, "bob", 50.0), desc(3, "carol", 90.0)],
            despawned: vec![9],
        }
    }

    #[test]
    fn test_snapshot_for_recipient() {
        let frame = snapshot().encode_for(Some(2), 118, &OpenField).unwrap();
        assert_eq!(frame.opcode(), opcode::SNAPSHOT);

        let view = SnapshotView::decode(frame.payload()).unwrap();
        assert_eq!(view.id, 4);
        assert_eq!(view.tick, 120);
        assert_eq!(view.client_tick, 118);

        let own = view.own.unwrap();
        assert_eq!(own.id, 2);
        assert_eq!(own.name, "bob");
        assert_eq!(own.velocity, 5.0);

        let ids: Vec<EntityId> = view.others.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
        // short form carries no velocity
        assert_eq!(view.others[0].velocity, 0.0);
        assert_eq!(view.others[0].weapons, vec![3]);
        assert_eq!(view.despawned, vec![9]);
    }

    #[test]
    fn test_snapshot_without_own_entity() {
        let frame = snapshot().encode_for(Some(77), 0, &OpenField).unwrap();
        let view = SnapshotView::decode(frame.payload()).unwrap();
        assert!(view.own.is_none());
        assert_eq!(view.others.len(), 3);
    }

    #[test]
    fn test_long_name_is_truncated() {
        let long = "x".repeat(200);
        let snap = Snapshot {
            id: 0,
            tick: 0,
            entities: vec![desc(1, &long, 0.0)],
            despawned: vec![],
        };
        let frame = snap.encode_for(None, 0, &OpenField).unwrap();
        let view = SnapshotView::decode(frame.payload()).unwrap();
        assert_eq!(view.others[0].name.len(), NAME_SIZE - 1);
    }

    #[test]
    fn test_world_config_carries_snapshot() {
        let config = WorldConfig::new(60, 20);
        let frame = config.encode(&snapshot(), Some(1), 0, &OpenField).unwrap();
        assert_eq!(frame.opcode(), opcode::CONFIG);

        let (decoded, view) = WorldConfig::decode(frame.payload()).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.ack_size as usize, ACK_SIZE);
        assert_eq!(view.own.unwrap().id, 1);
    }

    #[test]
    fn test_wall_hides_entities_behind_it() {
        // wall between bob (x 50) and carol (x 90)
        let geometry = WallAt(80.0);
        let view = SnapshotView::decode(snapshot().encode_for(Some(1), 0, &geometry).unwrap().payload()).unwrap();
        let ids: Vec<EntityId> = view.others.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);

        // carol still sees bob from the far side
        let view = SnapshotView::decode(snapshot().encode_for(Some(3), 0, &geometry).unwrap().payload()).unwrap();
        assert_eq!(view.others.len(), 2);
    }

    #[test]
    fn test_no_culling_without_own_entity() {
        let view = SnapshotView::decode(snapshot().encode_for(None, 0, &WallAt(30.0)).unwrap().payload()).unwrap();
        assert_eq!(view.others.len(), 3);
    }

    #[test]
    fn test_arena_bounds_hide_nobody_inside() {
        let geometry = ArenaBounds {
            width: 200.0,
            height: 100.0,
        };
        let view = SnapshotView::decode(snapshot().encode_for(Some(1), 0, &geometry).unwrap().payload()).unwrap();
        assert_eq!(view.others.len(), 2);
    }

    #[test]
    fn test_crowded_snapshot_fits_one_frame() {
        let snap = Snapshot {
            id: 1,
            tick: 1,
            entities: (0..30).map(|i| desc(i, &"n".repeat(40), i as f32 * 20.0)).collect(),
            despawned: vec![],
        };
        let frame = snap.encode_for(Some(0), 0, &OpenField).unwrap();
        assert!(frame.as_bytes().len() > 2048);
        assert!(frame.as_bytes().len() <= MAX_FRAME_SIZE);

        let view = SnapshotView::decode(frame.payload()).unwrap();
        assert_eq!(view.others.len(), 29);
    }

    #[test]
    fn test_entity_center() {
        let center = desc(1, "a", 10.0).center();
        assert_eq!(center, Vector2::new(19.0, 29.0));
    }
}
