use serde::{Deserialize, Serialize};

///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vector2 {
    ///Value along the x-axis.
    /// Positive direction is to the right.
    pub x: f32,
    ///Value along the y-axis.
    /// Positive direction is down, matching screen space.
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    ///Returns the unit vector pointing at `angle` radians.
    pub fn from_angle(angle: f32) -> Self {
        Self {
            x: angle.cos(),
            y: angle.sin(),
        }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector.
    pub fn normalize(&self) -> Vector2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vector2 { x: 0.0, y: 0.0 }
        } else {
            Vector2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vector2 {
        Vector2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    ///Returns the difference of two vectors.
    pub fn sub(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    ///Returns the dot product of two vectors.
    pub fn dot(&self, other: &Vector2) -> f32 {
        self.x * other.x + self.y * other.y
    }
}

/// Distance along a ray to its first intersection with a circle
///
/// Returns `None` when the ray misses the circle or the circle lies behind
/// the origin.
pub fn ray_circle_distance(origin: Vector2, angle: f32, center: Vector2, radius: f32) -> Option<f32> {
    let dir = Vector2::from_angle(angle);

    // projection of the center on the ray
    let t = center.sub(&origin).dot(&dir);
    let closest = origin.add(&dir.scale(t));
    let y = center.sub(&closest).magnitude();

    if y > radius {
        return None;
    }

    let half_chord = (radius * radius - y * y).sqrt();
    let dist = t - half_chord;
    if dist < 0.0 {
        return None;
    }
    Some(dist)
}

/// Static world geometry that can occlude a ray
pub trait StaticGeometry {
    /// Distance along the ray to the first obstacle, capped at `range`
    fn wall_distance(&self, origin: Vector2, angle: f32, range: f32) -> f32;
}

/// Geometry with nothing in it
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenField;

impl StaticGeometry for OpenField {
    fn wall_distance(&self, _origin: Vector2, _angle: f32, range: f32) -> f32 {
        range
    }
}

/// A rectangular arena whose borders are walls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArenaBounds {
    pub width: f32,
    pub height: f32,
}

impl StaticGeometry for ArenaBounds {
    fn wall_distance(&self, origin: Vector2, angle: f32, range: f32) -> f32 {
        let dir = Vector2::from_angle(angle);

        let exit_x = if dir.x > 0.0 {
            (self.width - origin.x) / dir.x
        } else if dir.x < 0.0 {
            -origin.x / dir.x
        } else {
            f32::INFINITY
        };

        let exit_y = if dir.y > 0.0 {
            (self.height - origin.y) / dir.y
        } else if dir.y < 0.0 {
            -origin.y / dir.y
        } else {
            f32::INFINITY
        };

        exit_x.min(exit_y).max(0.0).min(range)
    }
}
