//! Process-wide device registry.
//!
//! The registry is the explicit home of everything that is shared *per
//! device* rather than per context: the linear-algebra handle and the
//! neural-primitives handle. Contexts on the same device share these; a
//! context binds a handle to its own queue for the duration of one kernel
//! by locking the per-device mutex, which is the rebind-per-use rule that
//! keeps handle state consistent when several queues issue work through it.
//!
//! The registry is initialized once for the lifetime of the process, either
//! implicitly on first use or explicitly through [`init`]. Context
//! destruction never releases registry state.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use once_cell::sync::OnceCell;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::device::Device;
use crate::error::FluxRustError;

/// Number of accelerator queues enumerated when the registry initializes
/// itself implicitly. Two, so that cross-device paths work out of the box.
pub const DEFAULT_ACCEL_DEVICES: usize = 2;

static REGISTRY: OnceCell<DeviceRegistry> = OnceCell::new();

/// Explicitly initializes the registry with `accel_devices` accelerator
/// devices. Idempotent when called again with the same count.
///
/// # Errors
/// `RegistryError` if the registry was already initialized with a different
/// device count.
pub fn init(accel_devices: usize) -> Result<(), FluxRustError> {
    let registry = REGISTRY.get_or_init(|| DeviceRegistry::enumerate(accel_devices));
    if registry.accel_count() != accel_devices {
        return Err(FluxRustError::RegistryError {
            message: format!(
                "registry already initialized with {} accelerator device(s), cannot re-init with {}",
                registry.accel_count(),
                accel_devices
            ),
        });
    }
    Ok(())
}

/// Per-device shared state: the handles every context bound to this device
/// rebinds on use.
#[derive(Debug)]
pub(crate) struct DeviceEntry {
    pub(crate) device: Device,
    pub(crate) blas: Mutex<BlasHandle>,
    pub(crate) nn: Mutex<NnHandle>,
}

impl DeviceEntry {
    fn new(device: Device, rng_seed: u64) -> Arc<Self> {
        Arc::new(DeviceEntry {
            device,
            blas: Mutex::new(BlasHandle::new()),
            nn: Mutex::new(NnHandle::new(rng_seed)),
        })
    }
}

/// Registry of all devices available to the process.
#[derive(Debug)]
pub struct DeviceRegistry {
    host: Arc<DeviceEntry>,
    accels: Vec<Arc<DeviceEntry>>,
}

impl DeviceRegistry {
    fn enumerate(accel_devices: usize) -> Self {
        info!(
            "initializing device registry: host + {} accelerator queue(s)",
            accel_devices
        );
        let accels = (0..accel_devices as u32)
            .map(|id| {
                debug!("registering accelerator device {}", id);
                DeviceEntry::new(Device::Accel(id), 0x5eed ^ u64::from(id))
            })
            .collect();
        DeviceRegistry {
            host: DeviceEntry::new(Device::Cpu, 0x5eed_c0de),
            accels,
        }
    }

    /// The process-wide registry, enumerating [`DEFAULT_ACCEL_DEVICES`]
    /// accelerators if [`init`] was never called.
    pub fn global() -> &'static DeviceRegistry {
        REGISTRY.get_or_init(|| DeviceRegistry::enumerate(DEFAULT_ACCEL_DEVICES))
    }

    /// A standalone registry with `accel_devices` stub accelerators, for
    /// tests that want contexts against a registry they control instead of
    /// the process-wide one.
    pub fn with_devices(accel_devices: usize) -> DeviceRegistry {
        DeviceRegistry::enumerate(accel_devices)
    }

    /// Number of registered accelerator devices.
    pub fn accel_count(&self) -> usize {
        self.accels.len()
    }

    /// Checks that `device` names a registered device.
    pub fn validate(&self, device: Device) -> Result<(), FluxRustError> {
        match device {
            Device::Cpu => Ok(()),
            Device::Accel(id) if (id as usize) < self.accels.len() => Ok(()),
            Device::Accel(id) => Err(FluxRustError::InvalidDevice {
                id,
                available: self.accels.len(),
            }),
        }
    }

    pub(crate) fn entry(&self, device: Device) -> Result<Arc<DeviceEntry>, FluxRustError> {
        match device {
            Device::Cpu => Ok(Arc::clone(&self.host)),
            Device::Accel(id) => {
                self.validate(device)?;
                Ok(Arc::clone(&self.accels[id as usize]))
            }
        }
    }
}

/// Linear-algebra handle, one per device.
///
/// Owns the grow-only packing workspace `gemm` falls back to when its output
/// aliases an operand allocation, so the common non-aliased call never
/// allocates.
#[derive(Debug)]
pub(crate) struct BlasHandle {
    pub(crate) workspace: Vec<f32>,
}

impl BlasHandle {
    fn new() -> Self {
        BlasHandle {
            workspace: Vec::new(),
        }
    }

    /// Reserves and returns the workspace, zero-filled, of at least `len`
    /// elements. Capacity grows monotonically for the process lifetime.
    pub(crate) fn workspace(&mut self, len: usize) -> &mut [f32] {
        if self.workspace.len() < len {
            self.workspace.resize(len, 0.0);
        }
        let ws = &mut self.workspace[..len];
        ws.fill(0.0);
        ws
    }
}

/// Neural-primitives handle, one per device: softmax row scratch and the
/// device's dropout generator.
#[derive(Debug)]
pub(crate) struct NnHandle {
    pub(crate) row_scratch: Vec<f32>,
    pub(crate) rng: StdRng,
}

impl NnHandle {
    fn new(seed: u64) -> Self {
        NnHandle {
            row_scratch: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn row_scratch(&mut self, len: usize) -> &mut [f32] {
        if self.row_scratch.len() < len {
            self.row_scratch.resize(len, 0.0);
        }
        &mut self.row_scratch[..len]
    }
}
