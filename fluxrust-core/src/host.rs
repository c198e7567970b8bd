//! Host-resident dense matrices used on the transfer boundary.

use crate::error::FluxRustError;
use crate::types::Element;

/// A 2-D host array in column-major order, the only shape the transfer
/// boundary understands. This is the host-side mirror of a `Buffer`'s
/// logical extent; it carries no device or queue state.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix<T> {
    data: Vec<T>,
    nrows: usize,
    ncols: usize,
}

impl<T: Element> HostMatrix<T> {
    /// Zero-initialized matrix.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        HostMatrix {
            data: vec![T::zero(); nrows * ncols],
            nrows,
            ncols,
        }
    }

    /// Matrix with every element set to `value`.
    pub fn full(nrows: usize, ncols: usize, value: T) -> Self {
        HostMatrix {
            data: vec![value; nrows * ncols],
            nrows,
            ncols,
        }
    }

    /// Builds each element from its `(row, col)` position.
    pub fn from_fn(nrows: usize, ncols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut m = HostMatrix::zeros(nrows, ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                m.data[j * nrows + i] = f(i, j);
            }
        }
        m
    }

    /// Wraps an existing column-major vector.
    ///
    /// # Errors
    /// `ShapeMismatch` if the vector length does not match the extents.
    pub fn from_vec(data: Vec<T>, nrows: usize, ncols: usize) -> Result<Self, FluxRustError> {
        if data.len() != nrows * ncols {
            return Err(FluxRustError::ShapeMismatch {
                expected: (nrows, ncols),
                actual: (data.len(), 1),
                operation: "HostMatrix::from_vec".to_string(),
            });
        }
        Ok(HostMatrix { data, nrows, ncols })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn get(&self, i: usize, j: usize) -> T {
        assert!(i < self.nrows && j < self.ncols);
        self.data[j * self.nrows + i]
    }

    pub fn set(&mut self, i: usize, j: usize, value: T) {
        assert!(i < self.nrows && j < self.ncols);
        self.data[j * self.nrows + i] = value;
    }

    /// The backing column-major slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn into_vec(self) -> Vec<T> {
        self.data
    }
}
