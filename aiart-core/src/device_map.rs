use std::fmt;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

use crate::Result;

/// Compute device identifier, as written by the user (`cpu`, `cuda:1`, ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceId {
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// Kept verbatim; fails when the device is opened.
    Unknown(String),
}

impl DeviceId {
    pub fn parse(id: &str) -> Self {
        let id = id.trim();
        let (backend, ordinal) = match id.split_once(':') {
            Some((backend, ordinal)) => match ordinal.parse::<usize>() {
                Ok(ordinal) => (backend, ordinal),
                Err(_) => return Self::Unknown(id.to_string()),
            },
            None => (id, 0),
        };
        match backend {
            "cpu" if !id.contains(':') => Self::Cpu,
            "cuda" => Self::Cuda(ordinal),
            "metal" => Self::Metal(ordinal),
            _ => Self::Unknown(id.to_string()),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Cuda(_) | Self::Metal(_) => DeviceKind::Accelerator,
            Self::Cpu | Self::Unknown(_) => DeviceKind::Cpu,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
            Self::Unknown(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Accelerator,
    Cpu,
}

/// Device chosen once when a generator is constructed.
///
/// The kind decides whether half precision and autocast may be used. It
/// never changes for the lifetime of the generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDevice {
    id: DeviceId,
    kind: DeviceKind,
}

impl ResolvedDevice {
    pub fn new(id: DeviceId) -> Self {
        let kind = id.kind();
        Self { id, kind }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceId::Cpu)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind == DeviceKind::Accelerator
    }

    /// Opens the candle device. Invalid identifiers fail here.
    pub fn open(&self) -> Result<Device> {
        let device = match &self.id {
            DeviceId::Cpu => Device::Cpu,
            DeviceId::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            DeviceId::Metal(ordinal) => Device::new_metal(*ordinal)?,
            DeviceId::Unknown(id) => {
                return Err(candle_core::Error::Msg(format!("unknown device: {id}")).into())
            }
        };
        Ok(device)
    }

    #[cfg(test)]
    pub(crate) fn fake_accelerator() -> Self {
        Self {
            id: DeviceId::Cuda(0),
            kind: DeviceKind::Accelerator,
        }
    }
}

/// Picks the device for an optional user identifier.
///
/// `None` auto-selects: CUDA if available, then Metal, then the CPU.
pub fn resolve(device_id: Option<&str>) -> ResolvedDevice {
    match device_id {
        Some(device_id) => {
            tracing::info!("Using device: {}", device_id);
            ResolvedDevice::new(DeviceId::parse(device_id))
        }
        None if cuda_is_available() => {
            tracing::info!("CUDA enabled. Device: {}", DeviceId::Cuda(0));
            ResolvedDevice::new(DeviceId::Cuda(0))
        }
        None if metal_is_available() => {
            tracing::info!("Metal enabled. Device: {}", DeviceId::Metal(0));
            ResolvedDevice::new(DeviceId::Metal(0))
        }
        None => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "No accelerator is available. Using the CPU (build with `--features metal` to use the GPU)"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!(
                    "No accelerator is available. Using the CPU (build with `--features cuda` to use the GPU)"
                );
            }
            ResolvedDevice::cpu()
        }
    }
}

/// Device ids that can be offered to the user, accelerators included
/// only when they can actually be opened.
pub fn available_devices() -> Vec<DeviceId> {
    const MAX_CUDA_ORDINALS: usize = 16;

    let mut devices = Vec::new();
    if cuda_is_available() {
        for ordinal in 0..MAX_CUDA_ORDINALS {
            match Device::new_cuda(ordinal) {
                Ok(_) => devices.push(DeviceId::Cuda(ordinal)),
                Err(_) => break,
            }
        }
    }
    if metal_is_available() && Device::new_metal(0).is_ok() {
        devices.push(DeviceId::Metal(0));
    }
    devices
}
