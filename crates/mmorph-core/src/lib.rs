//! # mmorph-core
//!
//! Core types shared by the mmorph crates.
//!
//! - [`Image2d`] - Row-major 2D buffer with shared, copy-on-write storage
//! - [`Point2d`] - Signed (row, col) offset
//! - [`Window`] - Weighted point set used as a structuring element
//! - [`PixelSource`] - Read access the compute session needs from an image
//!
//! ## Crate Structure
//!
//! ```text
//! mmorph-core (this crate)
//!    ^
//!    |
//!    +-- mmorph-compute (device session, kernels)
//!    +-- mmorph-cli (benchmarks, diagnostics)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod image;
pub mod point;
pub mod window;

pub use error::{Error, Result};
pub use image::{Image2d, PixelSource};
pub use point::{Coord, Point2d};
pub use window::Window;
