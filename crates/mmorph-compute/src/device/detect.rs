//! Device detection and selection.

use std::fmt::Write as _;

use tracing::{info, warn};

use super::{ComputeDevice, DeviceClass, HostDevice};
use crate::{ComputeError, ComputeResult, config};

/// How to open a detected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// The in-process [`HostDevice`].
    Host,
    /// wgpu adapter by enumeration index.
    #[cfg(feature = "wgpu")]
    Wgpu { adapter: usize },
}

/// A device that can be opened.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub kind: DeviceKind,
    pub name: String,
    pub class: DeviceClass,
    pub backend: String,
}

/// Detect all usable devices.
///
/// Parallel devices come first, then the host device, then software
/// (CPU-type) wgpu adapters, so a CPU preference resolves to the host.
pub fn detect_devices() -> Vec<DeviceCandidate> {
    #[allow(unused_mut)]
    let mut gpus: Vec<DeviceCandidate> = Vec::new();
    #[allow(unused_mut)]
    let mut soft: Vec<DeviceCandidate> = Vec::new();

    #[cfg(feature = "wgpu")]
    for (index, adapter) in super::WgpuDevice::adapters().into_iter().enumerate() {
        let class = match adapter.device_type {
            wgpu::DeviceType::Cpu => DeviceClass::Cpu,
            _ => DeviceClass::Gpu,
        };
        let candidate = DeviceCandidate {
            kind: DeviceKind::Wgpu { adapter: index },
            name: adapter.name.clone(),
            class,
            backend: format!("{:?}", adapter.backend).to_lowercase(),
        };
        match class {
            DeviceClass::Cpu => soft.push(candidate),
            _ => gpus.push(candidate),
        }
    }

    let mut devices = gpus;
    if config::host_disabled() {
        warn!("Host device disabled by {}", config::ENV_DISABLE_HOST);
    } else {
        devices.push(DeviceCandidate {
            kind: DeviceKind::Host,
            name: "mmorph host".into(),
            class: DeviceClass::Cpu,
            backend: "host".into(),
        });
    }
    devices.extend(soft);
    devices
}

/// Picks the first device of class `pref`, falling back to the first
/// CPU-class device.
pub fn resolve_device(devices: &[DeviceCandidate], pref: DeviceClass) -> ComputeResult<&DeviceCandidate> {
    devices
        .iter()
        .find(|d| d.class.satisfies(pref))
        .or_else(|| devices.iter().find(|d| d.class == DeviceClass::Cpu))
        .ok_or(ComputeError::NoDevice { requested: pref })
}

/// Opens the device [`resolve_device`] selects for `pref`.
pub fn open_device(pref: DeviceClass) -> ComputeResult<Box<dyn ComputeDevice>> {
    let devices = detect_devices();
    let candidate = resolve_device(&devices, pref)?;
    if !candidate.class.satisfies(pref) {
        info!(requested = %pref, fallback = %candidate.name, "Falling back to CPU-class device");
    }
    info!(device = %candidate.name, class = %candidate.class, backend = %candidate.backend, "Opening device");

    match candidate.kind {
        DeviceKind::Host => Ok(Box::new(HostDevice::new())),
        #[cfg(feature = "wgpu")]
        DeviceKind::Wgpu { adapter } => Ok(Box::new(super::WgpuDevice::open(adapter)?)),
    }
}

/// Get description of available devices.
pub fn describe_devices() -> String {
    let devices = detect_devices();
    let mut desc = String::new();

    if devices.is_empty() {
        desc.push_str("(no devices)\n");
    }
    for (i, dev) in devices.iter().enumerate() {
        let _ = writeln!(desc, "[{i}] {} ({}, {})", dev.name, dev.class, dev.backend);
    }

    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, class: DeviceClass) -> DeviceCandidate {
        DeviceCandidate {
            kind: DeviceKind::Host,
            name: name.into(),
            class,
            backend: "test".into(),
        }
    }

    #[test]
    fn test_resolve_prefers_requested_class() {
        let devices = vec![candidate("gpu0", DeviceClass::Gpu), candidate("cpu0", DeviceClass::Cpu)];
        assert_eq!(resolve_device(&devices, DeviceClass::Gpu).unwrap().name, "gpu0");
        assert_eq!(resolve_device(&devices, DeviceClass::Cpu).unwrap().name, "cpu0");
        assert_eq!(resolve_device(&devices, DeviceClass::Any).unwrap().name, "gpu0");
    }

    #[test]
    fn test_resolve_falls_back_to_cpu() {
        let devices = vec![candidate("cpu0", DeviceClass::Cpu)];
        assert_eq!(resolve_device(&devices, DeviceClass::Gpu).unwrap().name, "cpu0");
    }

    #[test]
    fn test_resolve_without_devices() {
        let err = resolve_device(&[], DeviceClass::Gpu).unwrap_err();
        assert!(matches!(err, ComputeError::NoDevice { requested: DeviceClass::Gpu }));

        // A parallel-only list cannot satisfy a CPU request.
        let devices = vec![candidate("gpu0", DeviceClass::Gpu)];
        assert!(resolve_device(&devices, DeviceClass::Cpu).is_err());
    }

    #[test]
    fn test_detect_includes_host() {
        if config::host_disabled() {
            return;
        }
        let devices = detect_devices();
        assert!(devices.iter().any(|d| d.kind == DeviceKind::Host));
        assert!(describe_devices().contains("mmorph host"));
    }
}
