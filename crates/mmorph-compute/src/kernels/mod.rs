//! Named kernel operations and their launch parameters.
//!
//! The program artifact exposes exactly the operations in [`KernelName`].
//! Each one takes an input and an output image buffer plus the typed
//! parameters of its [`Kernel`] variant:
//!
//! | Name | Parameters |
//! |------|------------|
//! | `unbitmap` | - |
//! | `binarize` | threshold, min, max |
//! | `bitmappedbinarize` | threshold, bit below, bit at/above, scratch |
//! | `naivemorph` | SE buffer, rowrad, colrad, count, target, SE + tile scratch |
//! | `bitmappedmorph_{dilation,erosion}_h` | colrad |
//! | `bitmappedmorph_{dilation,erosion}_v` | rowrad |
//!
//! # Packed format
//!
//! Packed ("bitmapped") images hold pixel `32 * w + b` in bit `b` of word `w`,
//! least significant bit first, in the first `pixels / 32` elements of the
//! buffer. Packed rows used by the morphology passes are `ncols / 32` words.

pub(crate) mod reference;

use std::fmt;
use std::str::FromStr;

use crate::device::{DeviceBuffer, DeviceInfo, NdRange, status};
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

/// Pixels per packed word.
pub const WORD_BITS: usize = 32;

/// Work-items per group for the packed kernels on parallel devices.
pub const PARALLEL_LANES: usize = 64;

// =============================================================================
// Names
// =============================================================================

/// Entry point names of the morphology program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelName {
    Unbitmap,
    Binarize,
    BitmappedBinarize,
    NaiveMorph,
    BitmappedDilationH,
    BitmappedDilationV,
    BitmappedErosionH,
    BitmappedErosionV,
}

impl KernelName {
    /// Every entry point, in program order.
    pub const ALL: [KernelName; 8] = [
        Self::Unbitmap,
        Self::Binarize,
        Self::BitmappedBinarize,
        Self::NaiveMorph,
        Self::BitmappedDilationH,
        Self::BitmappedDilationV,
        Self::BitmappedErosionH,
        Self::BitmappedErosionV,
    ];

    /// Entry point symbol.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbitmap => "unbitmap",
            Self::Binarize => "binarize",
            Self::BitmappedBinarize => "bitmappedbinarize",
            Self::NaiveMorph => "naivemorph",
            Self::BitmappedDilationH => "bitmappedmorph_dilation_h",
            Self::BitmappedDilationV => "bitmappedmorph_dilation_v",
            Self::BitmappedErosionH => "bitmappedmorph_erosion_h",
            Self::BitmappedErosionV => "bitmappedmorph_erosion_v",
        }
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelName {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ComputeError::device(status::INVALID_KERNEL_NAME, format!("no kernel named '{s}'")))
    }
}

// =============================================================================
// Kernel parameters
// =============================================================================

/// Structuring element bound to a `naivemorph` dispatch.
#[derive(Debug, Clone)]
pub struct SeBinding {
    /// `(row, col, weight)` triples.
    pub buffer: DeviceBuffer,
    pub rowrad: u32,
    pub colrad: u32,
    pub count: u32,
}

/// One kernel invocation: entry point plus typed arguments.
#[derive(Debug, Clone)]
pub enum Kernel {
    /// Expands packed words to one pixel per bit (1 set, 0 clear).
    Unbitmap,
    /// `out = if in >= threshold { max } else { min }`.
    Binarize { threshold: Pixel, min: Pixel, max: Pixel },
    /// Packs `in >= threshold` into bits; `below` / `above` give the bit value
    /// (only bit 0 is used) for each outcome.
    BitmappedBinarize {
        threshold: Pixel,
        below: Pixel,
        above: Pixel,
        scratch_bytes: usize,
    },
    /// Weighted neighborhood sum compared against `target`.
    NaiveMorph {
        se: SeBinding,
        target: i32,
        se_scratch_bytes: usize,
        tile_scratch_bytes: usize,
    },
    BitmappedDilationH { colrad: u32 },
    BitmappedDilationV { rowrad: u32 },
    BitmappedErosionH { colrad: u32 },
    BitmappedErosionV { rowrad: u32 },
}

impl Kernel {
    /// Entry point this invocation runs.
    pub fn name(&self) -> KernelName {
        match self {
            Self::Unbitmap => KernelName::Unbitmap,
            Self::Binarize { .. } => KernelName::Binarize,
            Self::BitmappedBinarize { .. } => KernelName::BitmappedBinarize,
            Self::NaiveMorph { .. } => KernelName::NaiveMorph,
            Self::BitmappedDilationH { .. } => KernelName::BitmappedDilationH,
            Self::BitmappedDilationV { .. } => KernelName::BitmappedDilationV,
            Self::BitmappedErosionH { .. } => KernelName::BitmappedErosionH,
            Self::BitmappedErosionV { .. } => KernelName::BitmappedErosionV,
        }
    }

    /// Work-group scratch memory the invocation requests.
    pub fn local_mem_bytes(&self) -> usize {
        match self {
            Self::BitmappedBinarize { scratch_bytes, .. } => *scratch_bytes,
            Self::NaiveMorph {
                se_scratch_bytes,
                tile_scratch_bytes,
                ..
            } => se_scratch_bytes + tile_scratch_bytes,
            _ => 0,
        }
    }

    /// Target sum, for `naivemorph`.
    pub fn target(&self) -> Option<i32> {
        match self {
            Self::NaiveMorph { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Structuring element buffer, for `naivemorph`.
    pub fn se_buffer(&self) -> Option<&DeviceBuffer> {
        match self {
            Self::NaiveMorph { se, .. } => Some(&se.buffer),
            _ => None,
        }
    }
}

// =============================================================================
// Launch
// =============================================================================

/// Everything a device needs to enqueue one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct KernelLaunch<'a> {
    pub kernel: &'a Kernel,
    pub input: &'a DeviceBuffer,
    pub output: &'a DeviceBuffer,
    pub nrows: u32,
    pub ncols: u32,
    pub global: NdRange,
    pub local: NdRange,
}

impl KernelLaunch<'_> {
    /// Checks the launch against device limits.
    ///
    /// Errors carry the status code a native runtime would return for the
    /// same launch.
    pub fn validate(&self, info: &DeviceInfo) -> ComputeResult<()> {
        let (global, local) = (self.global, self.local);
        let name = self.kernel.name();

        if self.nrows == 0 || self.ncols == 0 {
            return Err(ComputeError::device(
                status::INVALID_VALUE,
                format!("{name}: empty image {}x{}", self.nrows, self.ncols),
            ));
        }
        if global.dims() != local.dims() {
            return Err(ComputeError::device(
                status::INVALID_WORK_DIMENSION,
                format!("{name}: global {global} and local {local} differ in dimensions"),
            ));
        }
        if global.total() == 0 {
            return Err(ComputeError::device(
                status::INVALID_GLOBAL_WORK_SIZE,
                format!("{name}: empty global size {global}"),
            ));
        }
        if local.x() > info.max_work_item_sizes[0] || local.y() > info.max_work_item_sizes[1] {
            return Err(ComputeError::device(
                status::INVALID_WORK_ITEM_SIZE,
                format!(
                    "{name}: local {local} exceeds per-dimension limit {}x{}",
                    info.max_work_item_sizes[0], info.max_work_item_sizes[1]
                ),
            ));
        }
        if local.total() == 0 || local.total() > info.max_work_group_size {
            return Err(ComputeError::device(
                status::INVALID_WORK_GROUP_SIZE,
                format!(
                    "{name}: local {local} outside 1..={} work-items",
                    info.max_work_group_size
                ),
            ));
        }
        if !global.is_divisible_by(&local) {
            return Err(ComputeError::device(
                status::INVALID_WORK_GROUP_SIZE,
                format!("{name}: local {local} does not divide global {global}"),
            ));
        }
        let scratch = self.kernel.local_mem_bytes();
        if scratch > info.local_mem_bytes {
            return Err(ComputeError::device(
                status::OUT_OF_RESOURCES,
                format!(
                    "{name}: {scratch} bytes of local memory requested, device has {}",
                    info.local_mem_bytes
                ),
            ));
        }
        if self.input.id() == self.output.id() {
            return Err(ComputeError::device(
                status::INVALID_MEM_OBJECT,
                format!("{name}: input and output are the same buffer"),
            ));
        }
        let pixels = self.nrows as usize * self.ncols as usize;
        for buf in [self.input, self.output] {
            if buf.size_bytes() < pixels * ELEMENT_SIZE {
                return Err(ComputeError::device(
                    status::INVALID_BUFFER_SIZE,
                    format!(
                        "{name}: {}-byte buffer too small for {}x{} pixels",
                        buf.size_bytes(),
                        self.nrows,
                        self.ncols
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Work-groups per dimension.
    pub fn workgroups(&self) -> (usize, usize) {
        (
            self.global.x() / self.local.x().max(1),
            self.global.y() / self.local.y().max(1),
        )
    }
}
