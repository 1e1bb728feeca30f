//! Error types for mmorph-core operations.
//!
//! The [`Error`] enum covers failures of the container types:
//! - Image construction and bounds checking
//! - Structuring-element window shape validation
//!
//! # Usage
//!
//! ```rust
//! use mmorph_core::{Error, Result};
//!
//! fn check(row: u32, col: u32, nrows: u32, ncols: u32) -> Result<()> {
//!     if row >= nrows || col >= ncols {
//!         return Err(Error::out_of_bounds(row, col, nrows, ncols));
//!     }
//!     Ok(())
//! }
//! assert!(check(3, 0, 2, 2).is_err());
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core container types.
#[derive(Debug, Error)]
pub enum Error {
    /// Pixel coordinates are outside image bounds.
    #[error("pixel ({row}, {col}) out of bounds for image {nrows}x{ncols}")]
    OutOfBounds {
        /// Row that was accessed
        row: u32,
        /// Column that was accessed
        col: u32,
        /// Image row count
        nrows: u32,
        /// Image column count
        ncols: u32,
    },

    /// Data length does not match the requested shape.
    ///
    /// Returned by [`crate::Image2d::from_vec`] when `data.len() != nrows * ncols`.
    #[error("invalid dimensions: {nrows}x{ncols} ({reason})")]
    InvalidDimensions {
        /// Requested row count
        nrows: u32,
        /// Requested column count
        ncols: u32,
        /// Reason why dimensions are invalid
        reason: String,
    },

    /// Window shape is not usable as a centered structuring element.
    ///
    /// Rectangular windows need odd, non-zero side lengths so the origin
    /// sits in the middle.
    #[error("invalid window: {0}")]
    InvalidWindow(String),
}

impl Error {
    /// Creates an [`Error::OutOfBounds`] error.
    #[inline]
    pub fn out_of_bounds(row: u32, col: u32, nrows: u32, ncols: u32) -> Self {
        Self::OutOfBounds {
            row,
            col,
            nrows,
            ncols,
        }
    }

    /// Creates an [`Error::InvalidDimensions`] error.
    #[inline]
    pub fn invalid_dimensions(nrows: u32, ncols: u32, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            nrows,
            ncols,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::out_of_bounds(10, 4, 8, 8);
        assert!(err.to_string().contains("(10, 4)"));
        assert!(err.to_string().contains("8x8"));

        let err = Error::invalid_dimensions(3, 3, "expected 9 elements, got 4");
        assert!(err.to_string().contains("expected 9"));
    }
}
