use serde_derive::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

/// 2-D world position/velocity vector. All gameplay coordinates are expressed in world units.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    #[inline]
    pub fn new(x: f32, y: f32) -> Vec2 {
        Vec2 { x, y }
    }

    #[inline]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    #[inline]
    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).length()
    }

    /// Returns the unit length vector pointing the same way, or zero for a zero vector.
    #[inline]
    pub fn normalized(self) -> Vec2 {
        let len = self.length();

        match len > f32::EPSILON {
            true => Vec2::new(self.x / len, self.y / len),
            _ => Vec2::ZERO,
        }
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    #[inline]
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    #[inline]
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    #[inline]
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;

    #[inline]
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Identity of a world partition cell. The square with coordinates `(x, y)` covers the half open
/// world region `[x*side, (x+1)*side) × [y*side, (y+1)*side)`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GridSquare {
    pub x: i32,
    pub y: i32,
}

impl GridSquare {
    #[inline]
    pub fn new(x: i32, y: i32) -> GridSquare {
        GridSquare { x, y }
    }

    /// Returns the square owning the supplied world position.
    #[inline]
    pub fn containing(pos: Vec2, side: f32) -> GridSquare {
        GridSquare {
            x: (pos.x / side).floor() as i32,
            y: (pos.y / side).floor() as i32,
        }
    }

    /// World space center of the square.
    #[inline]
    pub fn center(self, side: f32) -> Vec2 {
        Vec2::new((self.x as f32 + 0.5) * side, (self.y as f32 + 0.5) * side)
    }

    /// World space minimum corner of the square.
    #[inline]
    pub fn min_corner(self, side: f32) -> Vec2 {
        Vec2::new(self.x as f32 * side, self.y as f32 * side)
    }

    /// True when the position lies within the square grown by `margin` world units on every edge.
    #[inline]
    pub fn contains_with_margin(self, pos: Vec2, side: f32, margin: f32) -> bool {
        let min = self.min_corner(side);

        pos.x >= min.x - margin
            && pos.x < min.x + side + margin
            && pos.y >= min.y - margin
            && pos.y < min.y + side + margin
    }

    /// True when the two squares share an edge or a corner.
    #[inline]
    pub fn is_adjacent(self, other: GridSquare) -> bool {
        let dx = (self.x - other.x).abs();
        let dy = (self.y - other.y).abs();

        dx <= 1 && dy <= 1 && (dx, dy) != (0, 0)
    }

    /// The eight squares surrounding this one.
    #[inline]
    pub fn neighbors(self) -> [GridSquare; 8] {
        [
            GridSquare::new(self.x - 1, self.y - 1),
            GridSquare::new(self.x, self.y - 1),
            GridSquare::new(self.x + 1, self.y - 1),
            GridSquare::new(self.x - 1, self.y),
            GridSquare::new(self.x + 1, self.y),
            GridSquare::new(self.x - 1, self.y + 1),
            GridSquare::new(self.x, self.y + 1),
            GridSquare::new(self.x + 1, self.y + 1),
        ]
    }
}
