//! Signed 2D offsets.

use std::fmt;

/// Signed coordinate along one axis.
pub type Coord = i32;

/// A (row, col) offset, ordered row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Point2d {
    /// Row offset.
    pub row: Coord,
    /// Column offset.
    pub col: Coord,
}

impl Point2d {
    /// Creates a point.
    #[inline]
    pub const fn new(row: Coord, col: Coord) -> Self {
        Self { row, col }
    }

    /// Component along axis `dim` (0 = row, 1 = col).
    ///
    /// # Panics
    ///
    /// Panics if `dim > 1`.
    #[inline]
    pub fn dim(&self, dim: usize) -> Coord {
        match dim {
            0 => self.row,
            1 => self.col,
            _ => panic!("Point2d has 2 dimensions, got index {dim}"),
        }
    }
}

impl From<(Coord, Coord)> for Point2d {
    fn from((row, col): (Coord, Coord)) -> Self {
        Self::new(row, col)
    }
}

impl fmt::Display for Point2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_row_major() {
        let mut pts = vec![Point2d::new(1, -1), Point2d::new(0, 2), Point2d::new(0, -3)];
        pts.sort();
        assert_eq!(pts, vec![Point2d::new(0, -3), Point2d::new(0, 2), Point2d::new(1, -1)]);
    }

    #[test]
    fn test_dim_and_display() {
        let p = Point2d::from((-2, 5));
        assert_eq!(p.dim(0), -2);
        assert_eq!(p.dim(1), 5);
        assert_eq!(p.to_string(), "(-2, 5)");
    }
}
