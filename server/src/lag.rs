//! Lag-compensated hit resolution
//!
//! A shot is judged against the world the shooter was looking at: the
//! newest snapshot not younger than the tick the shooter had acknowledged
//! when firing. Targets are taken at their recorded positions in that
//! snapshot, walls are taken from the static geometry.

use crate::history::SnapshotHistory;
use log::debug;
use shared::geometry::{ray_circle_distance, StaticGeometry, Vector2};
use shared::{EntityId, Tick};

/// A ranged action fired by one entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shot {
    pub shooter: EntityId,
    pub origin: Vector2,
    pub angle: f32,
    pub range: f32,
    pub damage: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitOutcome {
    Hit {
        target: EntityId,
        distance: f32,
        snapshot_tick: Tick,
    },
    /// A target was in line of fire but a wall came first
    Occluded { target: EntityId, wall_distance: f32 },
    Miss,
    /// Nothing recorded at or before the perceived tick; the shot is void
    NoSnapshot,
}

impl HitOutcome {
    pub fn target(&self) -> Option<EntityId> {
        match self {
            HitOutcome::Hit { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// Judges `shot` against the world as it was at `perceived_tick`
pub fn resolve(
    history: &SnapshotHistory,
    shot: &Shot,
    perceived_tick: Tick,
    geometry: &dyn StaticGeometry,
) -> HitOutcome {
    let snapshot = match history.at_or_before(perceived_tick) {
        Some(snapshot) => snapshot,
        None => {
            debug!(
                "no snapshot at or before tick {} for shot by {}, voided",
                perceived_tick, shot.shooter
            );
            return HitOutcome::NoSnapshot;
        }
    };

    let nearest = snapshot
        .entities
        .iter()
        .filter(|e| e.id != shot.shooter)
        .filter_map(|e| {
            ray_circle_distance(shot.origin, shot.angle, e.center(), e.radius).map(|d| (e.id, d))
        })
        .filter(|(_, d)| *d > 0.0 && *d <= shot.range)
        .min_by(|a, b| a.1.total_cmp(&b.1));

    let (target, distance) = match nearest {
        Some(nearest) => nearest,
        None => return HitOutcome::Miss,
    };

    // walls at or beyond range do not occlude
    let wall_distance = geometry.wall_distance(shot.origin, shot.angle, shot.range);
    if distance < wall_distance || wall_distance >= shot.range {
        HitOutcome::Hit {
            target,
            distance,
            snapshot_tick: snapshot.tick,
        }
    } else {
        HitOutcome::Occluded {
            target,
            wall_distance,
        }
    }
}
