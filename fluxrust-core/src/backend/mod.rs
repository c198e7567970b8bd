//! The backend compute library.
//!
//! Primitive numeric kernels invoked by buffer operations, split the way a
//! device backend splits them: dense linear algebra ([`blas`]), structural
//! and elementwise kernels ([`kernels`]), and nonlinearities ([`nonlin`]).
//!
//! Kernels execute *inside* operations already enqueued on a context; all
//! argument validation (shape, dtype, device) happened synchronously before
//! the enqueue, so kernels only `debug_assert` their preconditions and never
//! report failures. They receive [`crate::storage::Span`] snapshots and walk
//! them through raw element pointers, which keeps in-place updates with
//! aliased operands well-defined.

pub(crate) mod blas;
pub(crate) mod kernels;
pub(crate) mod nonlin;
