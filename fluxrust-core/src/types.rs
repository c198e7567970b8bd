use std::fmt::Debug;

/// Defines the possible data types for Buffer elements.
///
/// The engine moves values around without looking at them; only the backend
/// kernels care about the concrete type, and they support the same pair the
/// numeric library exposes: single-precision floats and 32-bit integers
/// (index matrices, labels, masks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating-point type.
    F32,
    /// 32-bit integer type.
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => std::mem::size_of::<f32>(),
            DType::I32 => std::mem::size_of::<i32>(),
        }
    }
}

/// Transpose selector for matrix-product operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trans {
    /// Use the operand as stored.
    N,
    /// Use the operand transposed.
    T,
}

/// Marker trait connecting a Rust scalar to its [`DType`] tag.
///
/// Implemented for exactly the types the backend kernels understand.
pub trait Element:
    Copy + Debug + PartialEq + Send + Sync + num_traits::NumAssign + 'static
{
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
