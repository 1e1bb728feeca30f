//! Structuring-element windows.
//!
//! A [`Window`] is a finite set of weighted offsets around an origin. The
//! compute session uploads it as contiguous `(row, col, weight)` triples and
//! derives the geometry the kernels need from it:
//!
//! - [`Window::nrows`] / [`Window::ncols`] - span along each axis
//! - [`Window::rowrad`] / [`Window::colrad`] - largest absolute offset
//! - [`Window::count`] - number of points (the "all hit" target sum)
//!
//! # Usage
//!
//! ```rust
//! use mmorph_core::Window;
//!
//! let se: Window<i32> = Window::rect(3, 5).unwrap();
//! assert_eq!(se.count(), 15);
//! assert_eq!((se.nrows(), se.ncols()), (3, 5));
//! assert_eq!((se.rowrad(), se.colrad()), (1, 2));
//! ```

use std::collections::BTreeSet;
use std::fmt;

use crate::{Coord, Error, Point2d, Result};

/// Weighted point set, iterated in (row, col, weight) order.
#[derive(Clone, PartialEq, Eq)]
pub struct Window<T> {
    points: BTreeSet<(Point2d, T)>,
}

impl<T: Copy + Ord> Window<T> {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self {
            points: BTreeSet::new(),
        }
    }

    /// Builds a window from flat `[row, col, weight, row, col, weight, ...]` data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWindow`] if the length is not a multiple of 3.
    pub fn from_triples(flat: &[T]) -> Result<Self>
    where
        T: Into<i64>,
    {
        if flat.len() % 3 != 0 {
            return Err(Error::InvalidWindow(format!(
                "{} values do not form (row, col, weight) triples",
                flat.len()
            )));
        }
        let mut win = Self::new();
        for t in flat.chunks_exact(3) {
            let row = coord_from(t[0].into())?;
            let col = coord_from(t[1].into())?;
            win.add(row, col, t[2]);
        }
        Ok(win)
    }

    /// Adds a point. Re-adding an identical (point, weight) pair is a no-op.
    pub fn add(&mut self, row: Coord, col: Coord, weight: T) -> &mut Self {
        self.points.insert((Point2d::new(row, col), weight));
        self
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, row: Coord, col: Coord, weight: T) -> Self {
        self.add(row, col, weight);
        self
    }

    /// Iterates `(offset, weight)` pairs in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (Point2d, T)> + '_ {
        self.points.iter().copied()
    }

    /// Number of points.
    #[inline]
    pub fn count(&self) -> u32 {
        self.points.len() as u32
    }

    /// True if the window has no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Smallest row offset.
    pub fn minrow(&self) -> Option<Coord> {
        self.mindim(0)
    }

    /// Largest row offset.
    pub fn maxrow(&self) -> Option<Coord> {
        self.maxdim(0)
    }

    /// Smallest column offset.
    pub fn mincol(&self) -> Option<Coord> {
        self.mindim(1)
    }

    /// Largest column offset.
    pub fn maxcol(&self) -> Option<Coord> {
        self.maxdim(1)
    }

    /// Row span, `maxrow - minrow + 1` (0 when empty).
    pub fn nrows(&self) -> u32 {
        self.span(0)
    }

    /// Column span, `maxcol - mincol + 1` (0 when empty).
    pub fn ncols(&self) -> u32 {
        self.span(1)
    }

    /// Largest absolute row offset.
    pub fn rowrad(&self) -> u32 {
        self.radius(0)
    }

    /// Largest absolute column offset.
    pub fn colrad(&self) -> u32 {
        self.radius(1)
    }

    fn mindim(&self, d: usize) -> Option<Coord> {
        self.points.iter().map(|(p, _)| p.dim(d)).min()
    }

    fn maxdim(&self, d: usize) -> Option<Coord> {
        self.points.iter().map(|(p, _)| p.dim(d)).max()
    }

    fn span(&self, d: usize) -> u32 {
        match (self.mindim(d), self.maxdim(d)) {
            (Some(lo), Some(hi)) => hi.abs_diff(lo).saturating_add(1),
            _ => 0,
        }
    }

    fn radius(&self, d: usize) -> u32 {
        self.points
            .iter()
            .map(|(p, _)| p.dim(d).unsigned_abs())
            .max()
            .unwrap_or(0)
    }
}

impl<T: Copy + Ord + From<i8>> Window<T> {
    /// Single point at the origin with weight 1.
    pub fn origin() -> Self {
        Self::new().with(0, 0, T::from(1))
    }

    /// 4-connected cross (origin plus its edge neighbors).
    pub fn c4() -> Self {
        let mut win = Self::new();
        for (r, c) in [(-1, 0), (0, -1), (0, 0), (0, 1), (1, 0)] {
            win.add(r, c, T::from(1));
        }
        win
    }

    /// 8-connected 3x3 square.
    pub fn c8() -> Self {
        let mut win = Self::new();
        for r in -1..=1 {
            for c in -1..=1 {
                win.add(r, c, T::from(1));
            }
        }
        win
    }

    /// Centered `nrows x ncols` rectangle of unit weights.
    ///
    /// # Errors
    ///
    /// Both sides must be odd and non-zero.
    pub fn rect(nrows: u32, ncols: u32) -> Result<Self> {
        if nrows == 0 || nrows % 2 == 0 || ncols == 0 || ncols % 2 == 0 {
            return Err(Error::InvalidWindow(format!(
                "rectangle sides must be odd, got {nrows}x{ncols}"
            )));
        }
        let (hr, hc) = ((nrows / 2) as Coord, (ncols / 2) as Coord);
        let mut win = Self::new();
        for r in -hr..=hr {
            for c in -hc..=hc {
                win.add(r, c, T::from(1));
            }
        }
        Ok(win)
    }
}

impl<T> Default for Window<T> {
    fn default() -> Self {
        Self {
            points: BTreeSet::new(),
        }
    }
}

fn coord_from(v: i64) -> Result<Coord> {
    Coord::try_from(v).map_err(|_| Error::InvalidWindow(format!("offset {v} out of range")))
}

impl<T: fmt::Display + Copy + Ord> fmt::Display for Window<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for (i, (p, w)) in self.points.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{{{p}, {w}}}")?;
        }
        write!(f, " ]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Window<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.points.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let win: Window<i32> = Window::new();
        assert!(win.is_empty());
        assert_eq!(win.minrow(), None);
        assert_eq!(win.nrows(), 0);
        assert_eq!(win.colrad(), 0);
    }

    #[test]
    fn test_geometry_matches_bounds() {
        let win: Window<i32> = Window::new()
            .with(-2, 0, 1)
            .with(1, 3, 1)
            .with(0, -1, 2);
        assert_eq!(win.count(), 3);
        assert_eq!(win.minrow(), Some(-2));
        assert_eq!(win.maxrow(), Some(1));
        assert_eq!(win.nrows(), 4);
        assert_eq!(win.ncols(), 5);
        assert_eq!(win.rowrad(), 2);
        assert_eq!(win.colrad(), 3);
    }

    #[test]
    fn test_asymmetric_radius_uses_absolute_offset() {
        let win: Window<i32> = Window::new().with(0, 0, 1).with(0, 4, 1);
        assert_eq!(win.ncols(), 5);
        assert_eq!(win.colrad(), 4);

        let win: Window<i32> = Window::new().with(-3, 0, 1).with(1, 0, 1);
        assert_eq!(win.rowrad(), 3);
    }

    #[test]
    fn test_extreme_offsets_do_not_overflow() {
        let win: Window<i32> = Window::new().with(-(1 << 30), 0, 1).with(1 << 30, 0, 1);
        assert_eq!(win.nrows(), (1 << 31) + 1);
        assert_eq!(win.rowrad(), 1 << 30);

        let win: Window<i32> = Window::new().with(0, i32::MIN, 1).with(0, i32::MAX, 1);
        assert_eq!(win.ncols(), u32::MAX);
        assert_eq!(win.colrad(), 1 << 31);
    }

    #[test]
    fn test_duplicate_points() {
        let mut win: Window<i32> = Window::new();
        win.add(0, 0, 1).add(0, 0, 1);
        assert_eq!(win.count(), 1);
        // Same offset with another weight is a distinct entry.
        win.add(0, 0, 2);
        assert_eq!(win.count(), 2);
    }

    #[test]
    fn test_standard_windows() {
        let c4: Window<i32> = Window::c4();
        assert_eq!(c4.count(), 5);
        assert_eq!((c4.nrows(), c4.ncols()), (3, 3));

        let c8: Window<i32> = Window::c8();
        assert_eq!(c8.count(), 9);

        let origin: Window<i32> = Window::origin();
        assert_eq!(origin.count(), 1);
        assert_eq!((origin.rowrad(), origin.colrad()), (0, 0));
    }

    #[test]
    fn test_rect_rejects_even_sides() {
        assert!(Window::<i32>::rect(4, 3).is_err());
        assert!(Window::<i32>::rect(3, 0).is_err());
        let win = Window::<i32>::rect(5, 7).unwrap();
        assert_eq!(win.count(), 35);
        assert_eq!((win.rowrad(), win.colrad()), (2, 3));
    }

    #[test]
    fn test_from_triples() {
        let win = Window::<i32>::from_triples(&[-1, 0, 1, 0, 0, 1, 1, 0, 1]).unwrap();
        assert_eq!(win.count(), 3);
        assert_eq!(win.nrows(), 3);
        assert_eq!(win.ncols(), 1);
        assert!(Window::<i32>::from_triples(&[0, 0]).is_err());
    }

    #[test]
    fn test_display() {
        let win: Window<i32> = Window::new().with(0, 1, 1).with(0, 0, 1);
        assert_eq!(win.to_string(), "[ {(0, 0), 1}, {(0, 1), 1} ]");
    }
}
