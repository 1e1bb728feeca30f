//! Device-session manager for mathematical morphology.
//!
//! Owns the device, its queue and the compiled kernel program, keeps every
//! open image double-buffered in device memory and chains morphology kernels
//! over it, swapping the in/out roles after each dispatch so consecutive
//! operations never copy.
//!
//! # Architecture
//!
//! ```text
//! DeviceSession (root)
//!     ├── Box<dyn ComputeDevice>
//!     │       ├── HostDevice   (in-process, CPU-class, rayon)
//!     │       └── WgpuDevice   (WGSL program, feature "wgpu")
//!     ├── BufferPool           (buffer pairs keyed by size)
//!     ├── SeStore              (structuring elements on the device)
//!     └── ImageSession*        (host pixels + pooled pair + geometry)
//! ```
//!
//! # Example
//!
//! ```rust
//! use mmorph_compute::{DeviceClass, DeviceSession};
//! use mmorph_core::{Image2d, Window};
//!
//! let mut session = DeviceSession::new(DeviceClass::Cpu)?;
//! let img = Image2d::from_fn(32, 32, |r, c| ((r * 7 + c * 3) % 256) as i32);
//! let se = session.load_se(&Window::rect(3, 3)?)?;
//!
//! let id = session.open(&img)?;
//! session.push_binarize(128, 0, 1)?;
//! session.push_naive_opening(se)?;
//! session.fetch(None)?.wait()?;
//! let out = session.save(id)?;
//! assert_eq!((out.nrows(), out.ncols()), (32, 32));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod device;
pub mod dispatch;
pub mod image;
pub mod kernels;
pub mod pool;
pub mod se;
pub mod session;
pub mod shaders;

pub use config::SessionConfig;
pub use device::{
    ComputeDevice, DeviceBuffer, DeviceClass, DeviceInfo, DispatchRecord, Event, HostBuffer, HostDevice,
    MemAccess, NdRange, PendingRead, describe_devices, detect_devices, resolve_device,
};
#[cfg(feature = "wgpu")]
pub use device::WgpuDevice;
pub use dispatch::MorphOp;
pub use image::{ImageId, ImageSession};
pub use kernels::{Kernel, KernelLaunch, KernelName, PARALLEL_LANES, WORD_BITS};
pub use pool::{BufferPair, BufferPool, PoolKeying};
pub use se::{SeDescriptor, SeId, SeStore};
pub use session::DeviceSession;

use thiserror::Error;

/// Pixel element type bound to every kernel buffer.
pub type Pixel = i32;

/// Size of one [`Pixel`] in bytes.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<Pixel>();

/// Device session errors
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("No {requested} device available")]
    NoDevice { requested: DeviceClass },

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),

    #[error("Program build failed:\n{log}")]
    ProgramBuild { log: String },

    #[error("Device error {code}: {message}")]
    Device { code: i32, message: String },

    #[error("{op}: {reason}")]
    Precondition { op: &'static str, reason: String },

    #[error("Unknown image id {0}")]
    UnknownImage(ImageId),

    #[error("Unknown structuring element id {0}")]
    UnknownSe(SeId),

    #[error("No current image")]
    NoCurrentImage,

    #[error("Invalid dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),

    #[error("Dimension mismatch: expected {expected} pixels, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Structuring element has no points")]
    EmptyStructuringElement,

    #[error("Invalid transfer: {requested} bytes from a {available}-byte buffer")]
    InvalidTransfer { requested: usize, available: usize },

    #[error(transparent)]
    Core(#[from] mmorph_core::Error),
}

impl ComputeError {
    /// Device error carrying a native status code, prefixed with its name.
    pub fn device(code: i32, message: impl AsRef<str>) -> Self {
        Self::Device {
            code,
            message: format!("{}: {}", device::status::name(code), message.as_ref()),
        }
    }

    /// Precondition failure for operation `op`.
    pub fn precondition(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Precondition {
            op,
            reason: reason.into(),
        }
    }

    /// Native status code, for [`ComputeError::Device`] only.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
