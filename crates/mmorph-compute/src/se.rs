//! Structuring elements resident on the device.

use std::collections::BTreeMap;
use std::fmt;

use mmorph_core::Window;
use tracing::debug;

use crate::device::{ComputeDevice, DeviceBuffer, MemAccess};
use crate::kernels::SeBinding;
use crate::{ComputeError, ComputeResult, Pixel};

/// Structuring element id, assigned from 0 upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeId(pub(crate) u32);

impl SeId {
    /// Raw id value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An uploaded structuring element.
#[derive(Debug, Clone)]
pub struct SeDescriptor {
    pub id: SeId,
    /// `(row, col, weight)` triples, in window order.
    pub buffer: DeviceBuffer,
    /// Row span.
    pub nrows: u32,
    /// Column span.
    pub ncols: u32,
    /// Largest absolute row offset.
    pub rowrad: u32,
    /// Largest absolute column offset.
    pub colrad: u32,
    /// Number of points.
    pub count: u32,
}

impl SeDescriptor {
    /// Size of the triples buffer in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer.size_bytes()
    }

    /// Binding for a `naivemorph` dispatch.
    pub fn binding(&self) -> SeBinding {
        SeBinding {
            buffer: self.buffer.clone(),
            rowrad: self.rowrad,
            colrad: self.colrad,
            count: self.count,
        }
    }

    /// Target sum for a dilation: any one point hitting.
    pub fn dilation_target(&self) -> i32 {
        -(self.count as i32) + 1
    }

    /// Target sum for an erosion: every point hitting.
    pub fn erosion_target(&self) -> i32 {
        self.count as i32
    }
}

/// Flattens a window into contiguous `(row, col, weight)` triples.
pub fn serialize(window: &Window<Pixel>) -> Vec<Pixel> {
    window
        .iter()
        .flat_map(|(p, w)| [p.row, p.col, w])
        .collect()
}

/// Loaded structuring elements.
#[derive(Debug, Default)]
pub struct SeStore {
    ses: BTreeMap<SeId, SeDescriptor>,
    next: u32,
}

impl SeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads `window` and returns its id.
    ///
    /// Empty windows are rejected: they have no radius and no meaningful
    /// target sum.
    pub fn load(&mut self, window: &Window<Pixel>, device: &dyn ComputeDevice) -> ComputeResult<SeId> {
        if window.is_empty() {
            return Err(ComputeError::EmptyStructuringElement);
        }
        let buffer = device.create_buffer_init(&serialize(window), MemAccess::ReadOnly)?;

        let id = SeId(self.next);
        self.next += 1;
        let desc = SeDescriptor {
            id,
            buffer,
            nrows: window.nrows(),
            ncols: window.ncols(),
            rowrad: window.rowrad(),
            colrad: window.colrad(),
            count: window.count(),
        };
        debug!(
            se = %id,
            count = desc.count,
            rowrad = desc.rowrad,
            colrad = desc.colrad,
            "Structuring element loaded"
        );
        self.ses.insert(id, desc);
        Ok(id)
    }

    /// Releases `id`; returns false if it was not loaded.
    pub fn unload(&mut self, id: SeId) -> bool {
        self.ses.remove(&id).is_some()
    }

    /// Descriptor for `id`.
    pub fn get(&self, id: SeId) -> ComputeResult<&SeDescriptor> {
        self.ses.get(&id).ok_or(ComputeError::UnknownSe(id))
    }

    /// Number of loaded elements.
    pub fn len(&self) -> usize {
        self.ses.len()
    }

    /// True if nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.ses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AsAny, HostBuffer, HostDevice};

    #[test]
    fn test_serialize_row_major_triples() {
        let win: Window<Pixel> = Window::new().with(1, 0, 2).with(-1, 0, 1);
        assert_eq!(serialize(&win), vec![-1, 0, 1, 1, 0, 2]);
    }

    #[test]
    fn test_load_derives_geometry() {
        let dev = HostDevice::new();
        let mut store = SeStore::new();
        let id = store.load(&Window::rect(5, 7).unwrap(), &dev).unwrap();
        assert_eq!(id.get(), 0);

        let se = store.get(id).unwrap();
        assert_eq!((se.nrows, se.ncols), (5, 7));
        assert_eq!((se.rowrad, se.colrad), (2, 3));
        assert_eq!(se.count, 35);
        assert_eq!(se.buffer_bytes(), 35 * 3 * 4);
        assert_eq!(se.dilation_target(), -34);
        assert_eq!(se.erosion_target(), 35);

        let host = se.buffer.as_any().downcast_ref::<HostBuffer>().unwrap();
        let data = host.snapshot().unwrap();
        assert_eq!(&data[..3], &[-2, -3, 1]);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let dev = HostDevice::new();
        let mut store = SeStore::new();
        let a = store.load(&Window::c4(), &dev).unwrap();
        assert!(store.unload(a));
        assert!(!store.unload(a));
        let b = store.load(&Window::c8(), &dev).unwrap();
        assert_eq!(b.get(), 1);
        assert!(matches!(store.get(a), Err(ComputeError::UnknownSe(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_empty_window() {
        let dev = HostDevice::new();
        let mut store = SeStore::new();
        let err = store.load(&Window::new(), &dev).unwrap_err();
        assert!(matches!(err, ComputeError::EmptyStructuringElement));
        assert!(store.is_empty());
    }
}
