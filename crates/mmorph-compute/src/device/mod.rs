//! Compute device abstraction.
//!
//! A [`ComputeDevice`] owns a context and one in-order queue. Everything the
//! session does goes through it: buffer allocation, asynchronous transfers,
//! kernel dispatch and program build.
//!
//! # Devices
//!
//! | Device | Class | Availability |
//! |--------|-------|--------------|
//! | [`HostDevice`] | CPU | always |
//! | `WgpuDevice` | GPU (or CPU for software adapters) | feature `wgpu` |
//!
//! # Buffers
//!
//! Device memory is handed out as [`DeviceBuffer`] (`Arc<dyn DeviceMemory>`).
//! Each device downcasts back to its own buffer type through [`AsAny`];
//! passing a buffer from another device is a [`status::INVALID_MEM_OBJECT`]
//! error.

mod detect;
mod event;
mod host;
#[cfg(feature = "wgpu")]
mod wgpu_device;

pub use detect::{DeviceCandidate, DeviceKind, describe_devices, detect_devices, open_device, resolve_device};
pub use event::{Command, Event, PendingRead};
pub use host::{DispatchRecord, HostBuffer, HostDevice};
#[cfg(feature = "wgpu")]
pub use wgpu_device::{WgpuBuffer, WgpuDevice};

pub(crate) use event::{Clock, Signal};

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::kernels::{KernelLaunch, KernelName};
use crate::{ComputeResult, Pixel};

// =============================================================================
// Status codes
// =============================================================================

/// Native status codes carried by [`crate::ComputeError::Device`].
///
/// Values follow the OpenCL numbering so logs from either device family read
/// the same.
pub mod status {
    pub const DEVICE_NOT_FOUND: i32 = -1;
    pub const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
    pub const BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_MEM_OBJECT: i32 = -38;
    pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const INVALID_KERNEL_NAME: i32 = -46;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_WORK_DIMENSION: i32 = -53;
    pub const INVALID_WORK_GROUP_SIZE: i32 = -54;
    pub const INVALID_WORK_ITEM_SIZE: i32 = -55;
    pub const INVALID_BUFFER_SIZE: i32 = -61;
    pub const INVALID_GLOBAL_WORK_SIZE: i32 = -63;

    /// Symbolic name of a status code.
    pub fn name(code: i32) -> &'static str {
        match code {
            0 => "SUCCESS",
            DEVICE_NOT_FOUND => "DEVICE_NOT_FOUND",
            MEM_OBJECT_ALLOCATION_FAILURE => "MEM_OBJECT_ALLOCATION_FAILURE",
            OUT_OF_RESOURCES => "OUT_OF_RESOURCES",
            PROFILING_INFO_NOT_AVAILABLE => "PROFILING_INFO_NOT_AVAILABLE",
            BUILD_PROGRAM_FAILURE => "BUILD_PROGRAM_FAILURE",
            INVALID_VALUE => "INVALID_VALUE",
            INVALID_MEM_OBJECT => "INVALID_MEM_OBJECT",
            INVALID_PROGRAM_EXECUTABLE => "INVALID_PROGRAM_EXECUTABLE",
            INVALID_KERNEL_NAME => "INVALID_KERNEL_NAME",
            INVALID_KERNEL_ARGS => "INVALID_KERNEL_ARGS",
            INVALID_WORK_DIMENSION => "INVALID_WORK_DIMENSION",
            INVALID_WORK_GROUP_SIZE => "INVALID_WORK_GROUP_SIZE",
            INVALID_WORK_ITEM_SIZE => "INVALID_WORK_ITEM_SIZE",
            INVALID_BUFFER_SIZE => "INVALID_BUFFER_SIZE",
            INVALID_GLOBAL_WORK_SIZE => "INVALID_GLOBAL_WORK_SIZE",
            _ => "UNKNOWN",
        }
    }
}

// =============================================================================
// Device description
// =============================================================================

/// Device class, used both as a preference and as a device property.
///
/// `Gpu` stands for any massively parallel device; `Any` is only meaningful
/// as a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    /// CPU or CPU emulation; dispatches with unit work-groups.
    Cpu,
    /// Parallel device (GPU or accelerator).
    #[default]
    Gpu,
    /// No preference.
    Any,
}

impl DeviceClass {
    /// True if a device of class `self` satisfies preference `pref`.
    pub fn satisfies(self, pref: DeviceClass) -> bool {
        pref == DeviceClass::Any || self == pref
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Any => "any",
        })
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "any" | "auto" => Ok(Self::Any),
            other => Err(format!("unknown device class '{other}' (expected cpu, gpu or any)")),
        }
    }
}

/// Static properties of an opened device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Driver or API backend ("host", "vulkan", "metal", ...).
    pub backend: String,
    /// Device class.
    pub class: DeviceClass,
    /// Parallel compute units.
    pub compute_units: usize,
    /// Maximum work-items per work-group.
    pub max_work_group_size: usize,
    /// Maximum work-group extent per dimension.
    pub max_work_item_sizes: [usize; 2],
    /// Work-group local (scratch) memory in bytes.
    pub local_mem_bytes: usize,
    /// Largest single allocation in bytes.
    pub max_alloc_bytes: usize,
    /// Total global memory in bytes.
    pub global_mem_bytes: u64,
}

impl DeviceInfo {
    /// True for CPU-class devices.
    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.class == DeviceClass::Cpu
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}] units={} wg<={} local={}KB alloc<={}MB",
            self.name,
            self.class,
            self.backend,
            self.compute_units,
            self.max_work_group_size,
            self.local_mem_bytes / 1024,
            self.max_alloc_bytes / (1024 * 1024),
        )
    }
}

// =============================================================================
// Dispatch geometry
// =============================================================================

/// A 1-D or 2-D index space (global size or work-group size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NdRange {
    /// One dimension.
    D1(usize),
    /// Two dimensions, `x` (columns) first.
    D2(usize, usize),
}

impl NdRange {
    /// Number of dimensions.
    #[inline]
    pub fn dims(&self) -> usize {
        match self {
            Self::D1(_) => 1,
            Self::D2(..) => 2,
        }
    }

    /// Extent along x.
    #[inline]
    pub fn x(&self) -> usize {
        match *self {
            Self::D1(x) | Self::D2(x, _) => x,
        }
    }

    /// Extent along y (1 for 1-D ranges).
    #[inline]
    pub fn y(&self) -> usize {
        match *self {
            Self::D1(_) => 1,
            Self::D2(_, y) => y,
        }
    }

    /// Total number of work-items.
    #[inline]
    pub fn total(&self) -> usize {
        self.x() * self.y()
    }

    /// Unit range with the same dimensionality.
    pub fn unit_like(&self) -> Self {
        match self {
            Self::D1(_) => Self::D1(1),
            Self::D2(..) => Self::D2(1, 1),
        }
    }

    /// True if every extent of `self` is a multiple of `local`'s.
    pub fn is_divisible_by(&self, local: &NdRange) -> bool {
        self.dims() == local.dims()
            && local.x() > 0
            && local.y() > 0
            && self.x() % local.x() == 0
            && self.y() % local.y() == 0
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::D1(x) => write!(f, "{x}"),
            Self::D2(x, y) => write!(f, "{x}x{y}"),
        }
    }
}

impl FromStr for NdRange {
    type Err = String;

    /// Parses `"64"` or `"16x16"`; zero extents are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| -> Result<usize, String> {
            match v.trim().parse::<usize>() {
                Ok(0) => Err(format!("zero extent in '{s}'")),
                Ok(n) => Ok(n),
                Err(e) => Err(format!("invalid extent '{v}' in '{s}': {e}")),
            }
        };
        match s.split_once(['x', 'X']) {
            Some((x, y)) => Ok(Self::D2(parse(x)?, parse(y)?)),
            None => Ok(Self::D1(parse(s)?)),
        }
    }
}

/// Largest power of two `<= cap` dividing `n` (1 for `n == 0`).
pub(crate) fn pow2_divisor(n: usize, cap: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let mut d = 1;
    while d * 2 <= cap && n % (d * 2) == 0 {
        d *= 2;
    }
    d
}

// =============================================================================
// Device memory
// =============================================================================

/// Helper trait for downcasting.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

/// Host access mode requested for a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    ReadWrite,
    ReadOnly,
}

/// A device allocation.
pub trait DeviceMemory: AsAny + Send + Sync + fmt::Debug {
    /// Process-unique id, stable for the allocation's lifetime.
    fn id(&self) -> u64;

    /// Size in bytes.
    fn size_bytes(&self) -> usize;

    /// Access mode the buffer was created with.
    fn access(&self) -> MemAccess;

    /// Size in pixels.
    fn pixels(&self) -> usize {
        self.size_bytes() / crate::ELEMENT_SIZE
    }
}

/// Shared handle to device memory.
pub type DeviceBuffer = Arc<dyn DeviceMemory>;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_buffer_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// ComputeDevice
// =============================================================================

/// A device context with one in-order command queue.
///
/// Commands run in submission order. Every `enqueue_*` returns as soon as the
/// command is queued; the returned [`Event`] (or [`PendingRead`]) reports
/// completion.
pub trait ComputeDevice: AsAny + Send + Sync {
    /// Static device properties.
    fn info(&self) -> &DeviceInfo;

    /// Compiles `source` and binds every [`KernelName`] entry point.
    ///
    /// Fails with [`crate::ComputeError::ProgramBuild`] carrying the compiler
    /// log verbatim.
    fn build_program(&mut self, source: &str) -> ComputeResult<()>;

    /// True once a program has been built.
    fn has_program(&self) -> bool;

    /// Allocates `size_bytes` of device memory (contents unspecified).
    fn create_buffer(&self, size_bytes: usize, access: MemAccess) -> ComputeResult<DeviceBuffer>;

    /// Allocates a buffer initialized from `data` (blocking copy).
    fn create_buffer_init(&self, data: &[Pixel], access: MemAccess) -> ComputeResult<DeviceBuffer>;

    /// Enqueues a host-to-device copy of `data` to the start of `dst`.
    fn enqueue_write(&self, dst: &DeviceBuffer, data: &[Pixel]) -> ComputeResult<Event>;

    /// Enqueues a device-to-host copy of the first `len` pixels of `src`.
    fn enqueue_read(&self, src: &DeviceBuffer, len: usize) -> ComputeResult<PendingRead>;

    /// Enqueues one kernel dispatch.
    fn enqueue_kernel(&self, launch: &KernelLaunch<'_>) -> ComputeResult<Event>;

    /// Submits queued work without waiting.
    fn flush(&self) -> ComputeResult<()>;

    /// Blocks until every queued command has completed.
    fn finish(&self) -> ComputeResult<()>;

    /// Work-group size used when the caller did not set one.
    ///
    /// CPU-class devices always use unit groups; parallel devices take the
    /// largest power-of-two group (up to 64 items in 1-D, 8x8 in 2-D) that
    /// divides `global`.
    fn preferred_local_size(&self, global: NdRange) -> NdRange {
        if self.info().is_cpu() {
            return global.unit_like();
        }
        match global {
            NdRange::D1(x) => NdRange::D1(pow2_divisor(x, crate::PARALLEL_LANES)),
            NdRange::D2(x, y) => NdRange::D2(pow2_divisor(x, 8), pow2_divisor(y, 8)),
        }
    }
}

/// Entry points the session requires from a program.
pub(crate) fn missing_entry_points(found: &[&str]) -> Vec<&'static str> {
    KernelName::ALL
        .iter()
        .map(|k| k.as_str())
        .filter(|name| !found.contains(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndrange_parse() {
        assert_eq!("64".parse::<NdRange>(), Ok(NdRange::D1(64)));
        assert_eq!("16x8".parse::<NdRange>(), Ok(NdRange::D2(16, 8)));
        assert_eq!(" 4 X 2 ".parse::<NdRange>(), Ok(NdRange::D2(4, 2)));
        assert!("0x8".parse::<NdRange>().is_err());
        assert!("abc".parse::<NdRange>().is_err());
    }

    #[test]
    fn test_ndrange_divisibility() {
        let global = NdRange::D2(640, 480);
        assert!(global.is_divisible_by(&NdRange::D2(16, 16)));
        assert!(!global.is_divisible_by(&NdRange::D2(7, 1)));
        assert!(!global.is_divisible_by(&NdRange::D1(16)));
        assert_eq!(global.total(), 640 * 480);
        assert_eq!(NdRange::D1(5).y(), 1);
        assert_eq!(global.to_string(), "640x480");
    }

    #[test]
    fn test_pow2_divisor() {
        assert_eq!(pow2_divisor(640, 8), 8);
        assert_eq!(pow2_divisor(20, 8), 4);
        assert_eq!(pow2_divisor(7, 8), 1);
        assert_eq!(pow2_divisor(4096, 64), 64);
        assert_eq!(pow2_divisor(0, 64), 1);
    }

    #[test]
    fn test_device_class() {
        assert_eq!("GPU".parse::<DeviceClass>(), Ok(DeviceClass::Gpu));
        assert_eq!("auto".parse::<DeviceClass>(), Ok(DeviceClass::Any));
        assert!("tpu".parse::<DeviceClass>().is_err());
        assert!(DeviceClass::Cpu.satisfies(DeviceClass::Any));
        assert!(!DeviceClass::Cpu.satisfies(DeviceClass::Gpu));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status::name(status::INVALID_WORK_GROUP_SIZE), "INVALID_WORK_GROUP_SIZE");
        assert_eq!(status::name(-9999), "UNKNOWN");
    }

    #[test]
    fn test_missing_entry_points() {
        let all: Vec<&str> = KernelName::ALL.iter().map(|k| k.as_str()).collect();
        assert!(missing_entry_points(&all).is_empty());
        let missing = missing_entry_points(&["binarize", "unbitmap"]);
        assert_eq!(missing.len(), KernelName::ALL.len() - 2);
        assert!(missing.contains(&"naivemorph"));
    }
}
