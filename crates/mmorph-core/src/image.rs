//! Row-major 2D image container.
//!
//! [`Image2d`] stores `nrows * ncols` elements in row-major order:
//!
//! ```text
//! Memory: [p(0,0) p(0,1) ... p(0,ncols-1)]  <- Row 0
//!         [p(1,0) p(1,1) ... p(1,ncols-1)]  <- Row 1
//!         ...
//! ```
//!
//! # Memory Management
//!
//! The buffer lives in an [`Arc<Vec<T>>`]: cloning an image shares the
//! pixels, and the first write through [`Image2d::data_mut`] or
//! [`Image2d::set`] detaches a private copy (copy-on-write).
//!
//! ```rust
//! use mmorph_core::Image2d;
//!
//! let a: Image2d<i32> = Image2d::filled(2, 2, 7);
//! let mut b = a.clone();
//! assert!(a.shares_data(&b));
//!
//! b.set(0, 0, 1);
//! assert!(!a.shares_data(&b));
//! assert_eq!(a.get(0, 0), 7);
//! ```

use std::sync::Arc;

use rayon::prelude::*;

use crate::{Error, Result};

/// Read access to a row-major pixel grid.
///
/// This is everything a compute session needs to copy an image into
/// device memory; [`Image2d`] implements it, and so can foreign containers.
pub trait PixelSource<T: Copy> {
    /// Number of rows.
    fn nrows(&self) -> u32;

    /// Number of columns.
    fn ncols(&self) -> u32;

    /// Element at (`row`, `col`).
    fn at(&self, row: u32, col: u32) -> T;

    /// Copies the grid into a fresh row-major vector.
    fn to_row_major(&self) -> Vec<T> {
        let (nrows, ncols) = (self.nrows(), self.ncols());
        let mut out = Vec::with_capacity(nrows as usize * ncols as usize);
        for r in 0..nrows {
            for c in 0..ncols {
                out.push(self.at(r, c));
            }
        }
        out
    }
}

/// Row-major image with shared copy-on-write storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Image2d<T> {
    data: Arc<Vec<T>>,
    nrows: u32,
    ncols: u32,
}

impl<T: Copy + Default + Send + Sync> Image2d<T> {
    /// Creates an image filled with `T::default()`.
    pub fn new(nrows: u32, ncols: u32) -> Self {
        Self::filled(nrows, ncols, T::default())
    }

    /// Creates an image with every element set to `value`.
    pub fn filled(nrows: u32, ncols: u32, value: T) -> Self {
        let len = nrows as usize * ncols as usize;
        Self {
            data: Arc::new(vec![value; len]),
            nrows,
            ncols,
        }
    }

    /// Creates an image from row-major data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] if `data.len() != nrows * ncols`.
    pub fn from_vec(nrows: u32, ncols: u32, data: Vec<T>) -> Result<Self> {
        let expected = nrows as usize * ncols as usize;
        if data.len() != expected {
            return Err(Error::invalid_dimensions(
                nrows,
                ncols,
                format!("expected {} elements, got {}", expected, data.len()),
            ));
        }
        Ok(Self {
            data: Arc::new(data),
            nrows,
            ncols,
        })
    }

    /// Builds an image by evaluating `f(row, col)` for every element.
    pub fn from_fn<F>(nrows: u32, ncols: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> T + Sync,
    {
        let mut data = vec![T::default(); nrows as usize * ncols as usize];
        if ncols > 0 {
            data.par_chunks_mut(ncols as usize)
                .enumerate()
                .for_each(|(r, row)| {
                    for (c, px) in row.iter_mut().enumerate() {
                        *px = f(r as u32, c as u32);
                    }
                });
        }
        Self {
            data: Arc::new(data),
            nrows,
            ncols,
        }
    }

    /// Number of rows.
    #[inline]
    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    /// Number of columns.
    #[inline]
    pub fn ncols(&self) -> u32 {
        self.ncols
    }

    /// Total element count (`nrows * ncols`).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the image has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw row-major data.
    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable row-major data; detaches shared storage first.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// True if both images point at the same storage.
    #[inline]
    pub fn shares_data(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Element at (`row`, `col`).
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[inline]
    pub fn get(&self, row: u32, col: u32) -> T {
        assert!(row < self.nrows && col < self.ncols, "pixel out of bounds");
        self.data[self.offset(row, col)]
    }

    /// Element at (`row`, `col`), or `None` when out of bounds.
    #[inline]
    pub fn try_get(&self, row: u32, col: u32) -> Option<T> {
        (row < self.nrows && col < self.ncols).then(|| self.data[self.offset(row, col)])
    }

    /// Sets the element at (`row`, `col`).
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[inline]
    pub fn set(&mut self, row: u32, col: u32, value: T) {
        assert!(row < self.nrows && col < self.ncols, "pixel out of bounds");
        let offset = self.offset(row, col);
        self.data_mut()[offset] = value;
    }

    /// Sets the element at (`row`, `col`), failing when out of bounds.
    pub fn try_set(&mut self, row: u32, col: u32, value: T) -> Result<()> {
        if row >= self.nrows || col >= self.ncols {
            return Err(Error::out_of_bounds(row, col, self.nrows, self.ncols));
        }
        self.set(row, col, value);
        Ok(())
    }

    /// Row `row` as a slice.
    #[inline]
    pub fn row(&self, row: u32) -> &[T] {
        let start = row as usize * self.ncols as usize;
        &self.data[start..start + self.ncols as usize]
    }

    /// Applies `f` to every element in parallel.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(T) -> T + Sync,
    {
        self.data_mut().par_iter_mut().for_each(|px| *px = f(*px));
    }

    /// Copies this image into a larger one whose sides are rounded up to
    /// multiples of `row_round` and `col_round`, filling the margin with `fill`.
    ///
    /// Dispatches with a fixed work-group size need the grid to be a
    /// multiple of the group; this is the usual way to get there.
    pub fn padded(&self, row_round: u32, col_round: u32, fill: T) -> Self {
        let nrows = round_up(self.nrows, row_round);
        let ncols = round_up(self.ncols, col_round);
        Self::from_fn(nrows, ncols, |r, c| {
            self.try_get(r, c).unwrap_or(fill)
        })
    }

    #[inline]
    fn offset(&self, row: u32, col: u32) -> usize {
        row as usize * self.ncols as usize + col as usize
    }
}

impl<T: Copy + Default + Send + Sync> PixelSource<T> for Image2d<T> {
    fn nrows(&self) -> u32 {
        self.nrows
    }

    fn ncols(&self) -> u32 {
        self.ncols
    }

    fn at(&self, row: u32, col: u32) -> T {
        self.get(row, col)
    }

    fn to_row_major(&self) -> Vec<T> {
        self.data.as_ref().clone()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Image2d<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image2d")
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .field("shared", &(Arc::strong_count(&self.data) > 1))
            .finish()
    }
}

/// Rounds `v` up to a multiple of `r` (`r == 0` leaves `v` unchanged).
#[inline]
fn round_up(v: u32, r: u32) -> u32 {
    if r == 0 || v == 0 {
        return v;
    }
    v.div_ceil(r) * r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_new() {
        let img: Image2d<i32> = Image2d::new(4, 6);
        assert_eq!(img.nrows(), 4);
        assert_eq!(img.ncols(), 6);
        assert_eq!(img.len(), 24);
        assert!(img.data().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(Image2d::from_vec(3, 3, vec![0i32; 8]).is_err());
        let img = Image2d::from_vec(2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(img.get(1, 0), 4);
        assert_eq!(img.row(1), &[4, 5, 6]);
    }

    #[test]
    fn test_copy_on_write() {
        let a: Image2d<i32> = Image2d::filled(3, 3, 5);
        let mut b = a.clone();
        assert!(a.shares_data(&b));

        b.set(1, 1, 9);
        assert!(!a.shares_data(&b));
        assert_eq!(a.get(1, 1), 5);
        assert_eq!(b.get(1, 1), 9);
    }

    #[test]
    fn test_try_access() {
        let mut img: Image2d<i32> = Image2d::new(2, 2);
        assert_eq!(img.try_get(2, 0), None);
        assert!(img.try_set(0, 2, 1).is_err());
        img.try_set(1, 1, 3).unwrap();
        assert_eq!(img.try_get(1, 1), Some(3));
    }

    #[test]
    fn test_from_fn_and_map() {
        let mut img = Image2d::from_fn(3, 4, |r, c| (r * 10 + c) as i32);
        assert_eq!(img.get(2, 3), 23);
        img.map_inplace(|p| p * 2);
        assert_eq!(img.get(2, 3), 46);
    }

    #[test]
    fn test_padded() {
        let img = Image2d::from_fn(3, 5, |_, _| 1i32);
        let padded = img.padded(16, 16, 255);
        assert_eq!(padded.nrows(), 16);
        assert_eq!(padded.ncols(), 16);
        assert_eq!(padded.get(2, 4), 1);
        assert_eq!(padded.get(3, 0), 255);
        assert_eq!(padded.get(0, 5), 255);

        // Already aligned: unchanged shape
        let same = padded.padded(16, 16, 0);
        assert_eq!((same.nrows(), same.ncols()), (16, 16));
    }

    #[test]
    fn test_pixel_source_row_major() {
        let img = Image2d::from_vec(2, 2, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(PixelSource::to_row_major(&img), vec![1, 2, 3, 4]);
        assert_eq!(PixelSource::at(&img, 1, 0), 3);
    }
}
