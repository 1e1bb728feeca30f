//! Device session: the root object of the crate.
//!
//! A [`DeviceSession`] owns one device with its queue and built program,
//! the buffer pool, the structuring element store and every open image.
//! Dropping it releases all of them.

use std::collections::BTreeMap;

use mmorph_core::{Image2d, PixelSource, Window};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::device::{ComputeDevice, DeviceClass, DeviceInfo, Event, NdRange, open_device};
use crate::image::{ImageId, ImageSession};
use crate::pool::{BufferPair, BufferPool};
use crate::se::{SeDescriptor, SeId, SeStore};
use crate::shaders::MORPH_PROGRAM;
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

/// Device, program and every resource living on it.
pub struct DeviceSession {
    pub(crate) device: Box<dyn ComputeDevice>,
    config: SessionConfig,
    pub(crate) global_work_size: Option<NdRange>,
    pub(crate) local_work_size: Option<NdRange>,
    pool: BufferPool,
    pub(crate) images: BTreeMap<ImageId, ImageSession>,
    next_image: u32,
    current: Option<ImageId>,
    pub(crate) ses: SeStore,
}

impl DeviceSession {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Opens a device of class `device` (CPU-class fallback) and builds the
    /// morphology program on it.
    pub fn new(device: DeviceClass) -> ComputeResult<Self> {
        Self::with_config(SessionConfig::new(device))
    }

    /// Session configured from `MMORPH_*` environment variables.
    pub fn from_env() -> ComputeResult<Self> {
        Self::with_config(SessionConfig::from_env())
    }

    pub fn with_config(config: SessionConfig) -> ComputeResult<Self> {
        let device = open_device(config.device)?;
        Self::with_device(device, config)
    }

    /// Session on an already opened device.
    pub fn with_device(device: Box<dyn ComputeDevice>, config: SessionConfig) -> ComputeResult<Self> {
        Self::with_program(device, config, MORPH_PROGRAM)
    }

    /// Session running `source` instead of the bundled program.
    ///
    /// The program must declare every entry point in
    /// [`crate::KernelName::ALL`]; otherwise the build fails with
    /// [`ComputeError::ProgramBuild`].
    pub fn with_program(
        mut device: Box<dyn ComputeDevice>,
        config: SessionConfig,
        source: &str,
    ) -> ComputeResult<Self> {
        device.build_program(source)?;
        info!(device = %device.info(), "Device session ready");

        let mut session = Self {
            device,
            pool: BufferPool::new(config.pool_keying),
            global_work_size: config.global_work_size,
            local_work_size: None,
            images: BTreeMap::new(),
            next_image: 1,
            current: None,
            ses: SeStore::new(),
            config,
        };
        session.set_local_work_size(session.config.local_work_size);
        Ok(session)
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Copies `src` to the device and makes it the current image.
    ///
    /// The upload is enqueued, not awaited; the in-order queue runs it before
    /// anything pushed afterwards.
    pub fn open<S>(&mut self, src: &S) -> ComputeResult<ImageId>
    where
        S: PixelSource<Pixel> + ?Sized,
    {
        let (nrows, ncols) = (src.nrows(), src.ncols());
        if nrows == 0 || ncols == 0 {
            return Err(ComputeError::InvalidDimensions(nrows, ncols));
        }
        let host = src.to_row_major();
        let bytes = host.len() * ELEMENT_SIZE;

        let key = self.pool.key(bytes, Some((nrows, ncols)));
        let pair = self.pool.acquire(key, self.device.as_ref())?;
        self.device.enqueue_write(pair.first(), &host)?;

        let id = ImageId(self.next_image);
        self.next_image += 1;
        debug!(image = %id, nrows, ncols, bytes, "Image opened");

        self.images.insert(id, ImageSession::new(id, nrows, ncols, host, pair));
        self.current = Some(id);
        Ok(id)
    }

    /// Opens a row-major pixel slice of `nrows x ncols`.
    pub fn open_pixels(&mut self, pixels: &[Pixel], nrows: u32, ncols: u32) -> ComputeResult<ImageId> {
        let expected = nrows as usize * ncols as usize;
        if pixels.len() != expected {
            return Err(ComputeError::DimensionMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        if expected == 0 {
            return Err(ComputeError::InvalidDimensions(nrows, ncols));
        }
        self.open(&Image2d::from_vec(nrows, ncols, pixels.to_vec())?)
    }

    /// Downloads the current image's input buffer into its host array.
    ///
    /// `size` is in bytes (default: the whole image). Wait on the returned
    /// event, or call [`DeviceSession::save`], before using the data.
    pub fn fetch(&mut self, size: Option<usize>) -> ComputeResult<Event> {
        let id = self.current_id()?;
        self.fetch_image(id, size)
    }

    /// [`DeviceSession::fetch`] for image `id`.
    pub fn fetch_image(&mut self, id: ImageId, size: Option<usize>) -> ComputeResult<Event> {
        let image = self.images.get_mut(&id).ok_or(ComputeError::UnknownImage(id))?;
        let available = image.byte_size();
        let bytes = size.unwrap_or(available);
        if bytes == 0 || bytes % ELEMENT_SIZE != 0 || bytes > available {
            return Err(ComputeError::InvalidTransfer {
                requested: bytes,
                available,
            });
        }

        let read = self.device.enqueue_read(image.input(), bytes / ELEMENT_SIZE)?;
        let event = read.event().clone();
        image.set_pending(read)?;
        debug!(image = %id, bytes, "Download enqueued");
        Ok(event)
    }

    /// Copies image `id`'s host array into a new image.
    ///
    /// Waits for an outstanding download first.
    pub fn save(&mut self, id: ImageId) -> ComputeResult<Image2d<Pixel>> {
        let image = self.images.get_mut(&id).ok_or(ComputeError::UnknownImage(id))?;
        image.resolve_pending()?;
        image.to_image()
    }

    /// Host array of image `id`.
    ///
    /// Copies an outstanding download in first (waiting for it), so after
    /// `fetch` the array holds the downloaded pixels.
    pub fn host_pixels(&mut self, id: ImageId) -> ComputeResult<&[Pixel]> {
        let image = self.images.get_mut(&id).ok_or(ComputeError::UnknownImage(id))?;
        image.resolve_pending()?;
        Ok(image.host_pixels())
    }

    /// Closes image `id` and clears the current image.
    ///
    /// Unknown ids are ignored. Pooled device buffers stay in the pool.
    pub fn close(&mut self, id: ImageId) {
        if let Some(image) = self.images.remove(&id) {
            debug!(image = %id, dispatches = image.dispatch_count(), "Image closed");
        }
        self.current = None;
    }

    /// Makes open image `id` current.
    pub fn select(&mut self, id: ImageId) -> ComputeResult<()> {
        if !self.images.contains_key(&id) {
            return Err(ComputeError::UnknownImage(id));
        }
        self.current = Some(id);
        Ok(())
    }

    /// Current image, if any.
    pub fn current_image(&self) -> Option<ImageId> {
        self.current
    }

    pub(crate) fn current_id(&self) -> ComputeResult<ImageId> {
        self.current.ok_or(ComputeError::NoCurrentImage)
    }

    /// Open image `id`.
    pub fn image(&self, id: ImageId) -> ComputeResult<&ImageSession> {
        self.images.get(&id).ok_or(ComputeError::UnknownImage(id))
    }

    /// Number of open images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Rows of the current image.
    pub fn nrows(&self) -> ComputeResult<u32> {
        Ok(self.image(self.current_id()?)?.nrows())
    }

    /// Columns of the current image.
    pub fn ncols(&self) -> ComputeResult<u32> {
        Ok(self.image(self.current_id()?)?.ncols())
    }

    // =========================================================================
    // Structuring elements
    // =========================================================================

    /// Uploads `window` as a read-only device buffer.
    pub fn load_se(&mut self, window: &Window<Pixel>) -> ComputeResult<SeId> {
        self.ses.load(window, self.device.as_ref())
    }

    /// Releases structuring element `id`; unknown ids are ignored.
    pub fn unload_se(&mut self, id: SeId) {
        if self.ses.unload(id) {
            debug!(se = %id, "Structuring element unloaded");
        }
    }

    pub fn se(&self, id: SeId) -> ComputeResult<&SeDescriptor> {
        self.ses.get(id)
    }

    // =========================================================================
    // Buffer pool
    // =========================================================================

    /// Pair of `size`-byte buffers, shared with every caller asking for the
    /// same size.
    pub fn get_bufferpair(&mut self, size: usize) -> ComputeResult<BufferPair> {
        let key = self.pool.key(size, None);
        self.pool.acquire(key, self.device.as_ref())
    }

    /// Drops every pooled pair.
    ///
    /// Open images keep their pairs alive, but later opens allocate fresh
    /// ones instead of sharing them.
    pub fn clear_bufferpairs(&mut self) {
        self.pool.clear();
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // =========================================================================
    // Queue and geometry
    // =========================================================================

    /// Submits queued work without waiting.
    pub fn flush(&self) -> ComputeResult<()> {
        self.device.flush()
    }

    /// Blocks until every queued command has completed.
    pub fn finish(&self) -> ComputeResult<()> {
        self.device.finish()
    }

    /// Global size for image-grid kernels; `None` uses each image's
    /// `cols x rows`.
    pub fn set_global_work_size(&mut self, global: Option<NdRange>) {
        self.global_work_size = global;
    }

    /// Work-group size; `None` uses the device preference.
    ///
    /// CPU-class devices always run unit groups, whatever is requested.
    pub fn set_local_work_size(&mut self, local: Option<NdRange>) {
        self.local_work_size = match local {
            Some(local) if self.is_cpu() => {
                debug!(requested = %local, "Local size forced to unit on CPU-class device");
                Some(local.unit_like())
            }
            other => other,
        };
    }

    pub fn global_work_size(&self) -> Option<NdRange> {
        self.global_work_size
    }

    pub fn local_work_size(&self) -> Option<NdRange> {
        self.local_work_size
    }

    // =========================================================================
    // Device
    // =========================================================================

    pub fn device(&self) -> &dyn ComputeDevice {
        self.device.as_ref()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.device.info()
    }

    /// True if the session runs on a CPU-class device.
    pub fn is_cpu(&self) -> bool {
        self.device.info().is_cpu()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device.info().name)
            .field("images", &self.images.len())
            .field("ses", &self.ses.len())
            .field("pool", &self.pool.len())
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::pool::PoolKeying;

    fn cpu() -> DeviceSession {
        DeviceSession::with_device(Box::new(HostDevice::new()), SessionConfig::new(DeviceClass::Cpu)).unwrap()
    }

    #[test]
    fn test_image_ids_start_at_one() {
        let mut session = cpu();
        let img = Image2d::filled(2, 2, 5);
        let a = session.open(&img).unwrap();
        let b = session.open(&img).unwrap();
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(session.current_image(), Some(b));

        session.close(b);
        let c = session.open(&img).unwrap();
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_open_rejects_empty() {
        let mut session = cpu();
        let err = session.open(&Image2d::<Pixel>::new(0, 4)).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidDimensions(0, 4)));
        assert!(session.current_image().is_none());
    }

    #[test]
    fn test_open_pixels_checks_length() {
        let mut session = cpu();
        let err = session.open_pixels(&[1, 2, 3], 2, 2).unwrap_err();
        assert!(matches!(err, ComputeError::DimensionMismatch { expected: 4, actual: 3 }));
        let id = session.open_pixels(&[1, 2, 3, 4], 2, 2).unwrap();
        assert_eq!(session.save(id).unwrap().data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_fetch_validates_size() {
        let mut session = cpu();
        session.open(&Image2d::filled(2, 2, 1)).unwrap();
        for bad in [0, 3, 20] {
            let err = session.fetch(Some(bad)).unwrap_err();
            assert!(matches!(err, ComputeError::InvalidTransfer { available: 16, .. }));
        }
        session.fetch(Some(8)).unwrap().wait().unwrap();
    }

    #[test]
    fn test_fetch_then_wait_updates_host_pixels() {
        let mut session = cpu();
        let id = session.open_pixels(&[0, 100, 200, 300], 2, 2).unwrap();
        session.push_binarize(150, 0, 255).unwrap();
        let ev = session.fetch(None).unwrap();
        ev.wait().unwrap();
        assert!(ev.is_complete());

        assert_eq!(session.host_pixels(id).unwrap(), &[0, 0, 255, 255]);
        assert!(!session.image(id).unwrap().has_pending_read());
        assert_eq!(session.save(id).unwrap().data(), &[0, 0, 255, 255]);
    }

    #[test]
    fn test_partial_fetch_keeps_tail() {
        let mut session = cpu();
        let id = session.open(&Image2d::from_vec(1, 4, vec![5, 6, 7, 8]).unwrap()).unwrap();
        session.push_binarize(7, 0, 1).unwrap();
        session.fetch(Some(2 * ELEMENT_SIZE)).unwrap();
        assert_eq!(session.save(id).unwrap().data(), &[0, 0, 7, 8]);
    }

    #[test]
    fn test_select_and_current_dims() {
        let mut session = cpu();
        let a = session.open(&Image2d::filled(3, 5, 0)).unwrap();
        let _b = session.open(&Image2d::filled(4, 4, 0)).unwrap();
        assert_eq!(session.nrows().unwrap(), 4);
        session.select(a).unwrap();
        assert_eq!((session.nrows().unwrap(), session.ncols().unwrap()), (3, 5));

        session.close(a);
        assert!(matches!(session.select(a), Err(ComputeError::UnknownImage(_))));
        assert!(matches!(session.nrows(), Err(ComputeError::NoCurrentImage)));
        assert_eq!(session.image_count(), 1);
    }

    #[test]
    fn test_local_size_forced_on_cpu() {
        let mut session = cpu();
        session.set_local_work_size(Some(NdRange::D2(16, 16)));
        assert_eq!(session.local_work_size(), Some(NdRange::D2(1, 1)));

        let config = SessionConfig::default().with_local_work_size(NdRange::D2(16, 16));
        let session = DeviceSession::with_device(Box::new(HostDevice::emulating(DeviceClass::Gpu)), config).unwrap();
        assert_eq!(session.local_work_size(), Some(NdRange::D2(16, 16)));
    }

    #[test]
    fn test_pool_keying_from_config() {
        let config = SessionConfig::new(DeviceClass::Cpu).with_pool_keying(PoolKeying::ByShape);
        let mut session = DeviceSession::with_device(Box::new(HostDevice::new()), config).unwrap();
        session.open(&Image2d::filled(2, 8, 0)).unwrap();
        session.open(&Image2d::filled(4, 4, 0)).unwrap();
        assert_eq!(session.pool().len(), 2);
    }

    #[test]
    fn test_bufferpair_by_size() {
        let mut session = cpu();
        let a = session.get_bufferpair(256).unwrap();
        let b = session.get_bufferpair(256).unwrap();
        let c = session.get_bufferpair(512).unwrap();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        session.clear_bufferpairs();
        assert!(session.pool().is_empty());
    }
}
