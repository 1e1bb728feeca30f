//! Per-image state of a device session.
//!
//! An [`ImageSession`] owns the host copy of an open image and a handle to
//! the pooled buffer pair holding it on the device. The pair's roles flip
//! after every dispatch: what was just written becomes the next input.

use std::fmt;

use mmorph_core::Image2d;

use crate::device::{DeviceBuffer, NdRange, PendingRead};
use crate::pool::BufferPair;
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

/// Image id, assigned from 1 upward and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub(crate) u32);

impl ImageId {
    /// Raw id value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open image.
#[derive(Debug)]
pub struct ImageSession {
    id: ImageId,
    nrows: u32,
    ncols: u32,
    host: Vec<Pixel>,
    pair: BufferPair,
    swapped: bool,
    dispatches: u64,
    pending: Option<PendingRead>,
}

impl ImageSession {
    pub(crate) fn new(id: ImageId, nrows: u32, ncols: u32, host: Vec<Pixel>, pair: BufferPair) -> Self {
        Self {
            id,
            nrows,
            ncols,
            host,
            pair,
            swapped: false,
            dispatches: 0,
            pending: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ImageId {
        self.id
    }

    #[inline]
    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    #[inline]
    pub fn ncols(&self) -> u32 {
        self.ncols
    }

    /// `rows * cols`.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.nrows as usize * self.ncols as usize
    }

    /// Image size in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.pixel_count() * ELEMENT_SIZE
    }

    /// Default global size for image-grid kernels: `(cols, rows)`.
    #[inline]
    pub fn default_global_size(&self) -> NdRange {
        NdRange::D2(self.ncols as usize, self.nrows as usize)
    }

    /// The pooled pair backing this image.
    pub fn buffers(&self) -> &BufferPair {
        &self.pair
    }

    /// Buffer the next dispatch reads (and `fetch` downloads).
    pub fn input(&self) -> &DeviceBuffer {
        if self.swapped { self.pair.second() } else { self.pair.first() }
    }

    /// Buffer the next dispatch writes.
    pub fn output(&self) -> &DeviceBuffer {
        if self.swapped { self.pair.first() } else { self.pair.second() }
    }

    /// True once the roles have flipped an odd number of times.
    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    /// Dispatches issued against this image.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Host copy as of the last resolved download.
    pub(crate) fn host_pixels(&self) -> &[Pixel] {
        &self.host
    }

    /// True while a download has not been copied into the host array.
    ///
    /// [`crate::DeviceSession::host_pixels`] and [`crate::DeviceSession::save`]
    /// resolve it.
    pub fn has_pending_read(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn swap_buffers(&mut self) {
        self.swapped = !self.swapped;
        self.dispatches += 1;
    }

    /// Replaces the outstanding download, resolving the previous one first
    /// so downloads land in issue order.
    pub(crate) fn set_pending(&mut self, read: PendingRead) -> ComputeResult<()> {
        self.resolve_pending()?;
        self.pending = Some(read);
        Ok(())
    }

    /// Waits for the outstanding download and copies it into the host array.
    pub(crate) fn resolve_pending(&mut self) -> ComputeResult<()> {
        if let Some(read) = self.pending.take() {
            let data = read.complete()?;
            let available = self.byte_size();
            let dst = self.host.get_mut(..data.len()).ok_or(ComputeError::InvalidTransfer {
                requested: data.len() * ELEMENT_SIZE,
                available,
            })?;
            dst.copy_from_slice(&data);
        }
        Ok(())
    }

    /// Copies the host array into a new image of the same shape.
    pub(crate) fn to_image(&self) -> ComputeResult<Image2d<Pixel>> {
        if self.host.len() != self.pixel_count() {
            return Err(ComputeError::DimensionMismatch {
                expected: self.pixel_count(),
                actual: self.host.len(),
            });
        }
        Ok(Image2d::from_vec(self.nrows, self.ncols, self.host.clone())?)
    }
}
