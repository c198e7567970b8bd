// Déclare les modules principaux de la crate
mod backend;
pub mod buffer;
pub mod connector;
pub mod context;
pub mod device;
pub mod error;
pub mod host;
pub mod nn;
pub mod optim;
pub mod registry;
mod scratch;
mod storage;
pub mod types;

// Ré-exporte les types de surface pour un accès direct via `fluxrust_core::...`
pub use buffer::Buffer;
pub use connector::{Connector, GradSink};
pub use context::Context;
pub use device::Device;
pub use error::FluxRustError;
pub use host::HostMatrix;
pub use types::{DType, Element, Trans};

// Re-export traits required by public functions/structs
pub use num_traits;
