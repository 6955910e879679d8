use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

pub mod agent;
pub mod environment;
pub mod map;
pub mod session;

/// Represents a 2D coordinate on the board.
///
/// `x` is the row index (growing downward) and `y` the column index. Any pair of
/// integers is representable; whether a position lies on the board is the
/// environment's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }

    /// Stable hash code, `41 * x + 83 * y` truncated to 32 bits.
    ///
    /// Tables keyed on positions hash through this value, so it must not change.
    pub const fn hash_code(&self) -> i32 {
        self.x.wrapping_mul(41).wrapping_add(self.y.wrapping_mul(83))
    }

    /// Returns the position shifted by `(dx, dy)`.
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Position {
            x: self.x.wrapping_add(dx),
            y: self.y.wrapping_add(dy),
        }
    }

    /// Returns manhattan distance between two positions, saturating at `u32::MAX`
    pub const fn manhattan_distance(&self, other: &Position) -> u32 {
        self.x.abs_diff(other.x).saturating_add(self.y.abs_diff(other.y))
    }
}

impl Hash for Position {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hash_code());
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({}, {})", self.x, self.y)
    }
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Position { x, y }
    }
}
