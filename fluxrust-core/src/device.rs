use std::cell::Cell;

/// Identifies the compute unit a context or buffer is bound to.
///
/// `Cpu` executes on the calling thread; `Accel` names one of the
/// accelerator devices enumerated by the [`crate::registry::DeviceRegistry`].
/// In the reference backend each accelerator context is serviced by a
/// dedicated worker thread standing in for a device stream, so the ordering
/// and synchronization semantics are the same ones a real device backend
/// must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Synchronous execution in the calling thread. This is the default.
    #[default]
    Cpu,
    /// An asynchronous accelerator queue, identified by device index.
    Accel(u32),
}

impl Device {
    /// Returns true for accelerator devices.
    pub fn is_accel(&self) -> bool {
        matches!(self, Device::Accel(_))
    }
}

thread_local! {
    static CURRENT_DEVICE: Cell<Device> = const { Cell::new(Device::Cpu) };
}

/// The thread-local current device, consulted by device-defaulting buffer
/// factories. Set by [`crate::context::Context::activate`].
pub fn current_device() -> Device {
    CURRENT_DEVICE.with(|d| d.get())
}

pub(crate) fn set_current_device(device: Device) {
    CURRENT_DEVICE.with(|d| d.set(device));
}
