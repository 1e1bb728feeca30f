//! Session configuration and environment overrides.
//!
//! # Environment Variables
//!
//! - `MMORPH_DEVICE` - Device class preference (`cpu`, `gpu`, `any`)
//! - `MMORPH_LOCAL_SIZE` - Work-group size (`64` or `16x16`)
//! - `MMORPH_GLOBAL_SIZE` - Explicit global size for image-grid kernels
//! - `MMORPH_POOL_BY_SHAPE` - Key the buffer pool by image shape ("1" or "true")
//! - `MMORPH_DISABLE_HOST` - Hide the host device from detection ("1" or "true")
//!
//! Invalid values are logged and ignored.

use std::env;
use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

use crate::device::{DeviceClass, NdRange};
use crate::pool::PoolKeying;

pub const ENV_DEVICE: &str = "MMORPH_DEVICE";
pub const ENV_LOCAL_SIZE: &str = "MMORPH_LOCAL_SIZE";
pub const ENV_GLOBAL_SIZE: &str = "MMORPH_GLOBAL_SIZE";
pub const ENV_POOL_BY_SHAPE: &str = "MMORPH_POOL_BY_SHAPE";
pub const ENV_DISABLE_HOST: &str = "MMORPH_DISABLE_HOST";

/// Configuration for a [`crate::DeviceSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Preferred device class; CPU-class devices are the fallback.
    pub device: DeviceClass,
    /// Global size for image-grid kernels (default: the image's `cols x rows`).
    pub global_work_size: Option<NdRange>,
    /// Work-group size (default: the device's preference).
    pub local_work_size: Option<NdRange>,
    /// Buffer pool keying.
    pub pool_keying: PoolKeying,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DeviceClass::Gpu,
            global_work_size: None,
            local_work_size: None,
            pool_keying: PoolKeying::BySize,
        }
    }
}

impl SessionConfig {
    /// Default configuration preferring `device`.
    pub fn new(device: DeviceClass) -> Self {
        Self {
            device,
            ..Default::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Applies environment overrides on top of `self`.
    pub fn with_env(mut self) -> Self {
        if let Some(device) = env_parse(ENV_DEVICE) {
            self.device = device;
        }
        if let Some(local) = env_parse(ENV_LOCAL_SIZE) {
            self.local_work_size = Some(local);
        }
        if let Some(global) = env_parse(ENV_GLOBAL_SIZE) {
            self.global_work_size = Some(global);
        }
        if env_flag(ENV_POOL_BY_SHAPE) {
            self.pool_keying = PoolKeying::ByShape;
        }
        self
    }

    /// Sets the work-group size.
    pub fn with_local_work_size(mut self, local: NdRange) -> Self {
        self.local_work_size = Some(local);
        self
    }

    /// Sets the global size for image-grid kernels.
    pub fn with_global_work_size(mut self, global: NdRange) -> Self {
        self.global_work_size = Some(global);
        self
    }

    /// Sets the buffer pool keying.
    pub fn with_pool_keying(mut self, keying: PoolKeying) -> Self {
        self.pool_keying = keying;
        self
    }
}

/// True if the host device should be left out of detection.
pub fn host_disabled() -> bool {
    env_flag(ENV_DISABLE_HOST)
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = env::var(key).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %value, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.device, DeviceClass::Gpu);
        assert!(config.global_work_size.is_none());
        assert!(config.local_work_size.is_none());
        assert_eq!(config.pool_keying, PoolKeying::BySize);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::new(DeviceClass::Cpu)
            .with_local_work_size(NdRange::D2(16, 16))
            .with_global_work_size(NdRange::D2(64, 32))
            .with_pool_keying(PoolKeying::ByShape);
        assert_eq!(config.device, DeviceClass::Cpu);
        assert_eq!(config.local_work_size, Some(NdRange::D2(16, 16)));
        assert_eq!(config.global_work_size, Some(NdRange::D2(64, 32)));
        assert_eq!(config.pool_keying, PoolKeying::ByShape);
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(!is_truthy("yes"));
        assert!(!is_truthy("0"));
    }

    #[test]
    fn test_unset_env_keeps_config() {
        let key = "MMORPH_TEST_UNSET_VARIABLE";
        assert_eq!(env_parse::<NdRange>(key), None);
        assert!(!env_flag(key));
    }
}
