use crate::device::Device;
use crate::types::DType;
use thiserror::Error;

/// Custom error type for the FluxRust framework.
///
/// Every failure surfaces synchronously at the call site, before any work is
/// enqueued on a context. There is no deferred error delivery from a queue.
#[derive(Error, Debug, PartialEq, Clone)] // PartialEq for easier testing
pub enum FluxRustError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?} during operation {operation}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
        operation: String,
    },

    #[error("Cannot broadcast shapes {lhs:?} and {rhs:?} in operation {operation}")]
    BroadcastError {
        lhs: (usize, usize),
        rhs: (usize, usize),
        operation: String,
    },

    #[error("Slice error: {message}")]
    SliceError { message: String },

    #[error("Type mismatch for operation '{operation}': expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        expected: DType,
        actual: DType,
        operation: String,
    },

    #[error("Invalid wiring: {message}")]
    Configuration { message: String },

    #[error("Logical extent {requested} exceeds the capacity {capacity} fixed at creation")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("Step protocol violation: {message}")]
    Protocol { message: String },

    #[error("Invalid device id {id}: {available} accelerator device(s) registered")]
    InvalidDevice { id: u32, available: usize },

    #[error("Device mismatch for operation '{operation}': expected {expected:?}, got {actual:?}")]
    DeviceMismatch {
        expected: Device,
        actual: Device,
        operation: String,
    },

    #[error("Device registry error: {message}")]
    RegistryError { message: String },

    #[error("Device resource allocation failed: {message}")]
    DeviceResource { message: String },

    #[error("Internal error: {0}")]
    InternalError(String),
}
