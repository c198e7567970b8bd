//! Dense 2-D buffers: ownership, views, logical extents, host transfer.
//!
//! A [`Buffer`] is a cheap-clone handle over shared metadata; the numeric
//! region itself lives in a [`crate::storage::Storage`] referenced by the
//! owner and every view cut from it. Views never copy: they address a
//! window of the parent's allocation, so writes through a view are visible
//! through the parent (and vice versa) once queue ordering makes them so.
//!
//! Every mutating primitive takes the [`Context`] it is issued on,
//! validates shape/dtype/device synchronously, then enqueues the kernel
//! and returns without blocking. The primitives themselves live in
//! [`ops`] and [`batch`]; this module owns lifecycle and layout.

pub mod batch;
pub mod ops;

use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::Context;
use crate::device::{current_device, Device};
use crate::error::FluxRustError;
use crate::host::HostMatrix;
use crate::registry::DeviceRegistry;
use crate::storage::{Span, Storage};
use crate::types::{DType, Element};

#[derive(Debug)]
pub(crate) struct BufferData {
    storage: Arc<Storage>,
    offset: usize,
    nrows: usize,
    ncols: usize,
    /// Leading dimension: element distance between column starts. Fixed at
    /// creation; logical resizes move `nrows`/`ncols` underneath it.
    ld: usize,
    /// Per-axis extents fixed at creation; `set_nrows`/`set_ncols` may move
    /// the logical extent anywhere at or below these.
    row_capacity: usize,
    col_capacity: usize,
    dtype: DType,
    device: Device,
    is_owner: bool,
}

impl BufferData {
    fn span(&self) -> Span {
        Span {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            nrows: self.nrows,
            ncols: self.ncols,
            ld: self.ld,
        }
    }

    fn is_contiguous(&self) -> bool {
        self.ld == self.nrows || self.ncols <= 1
    }
}

/// An owning or non-owning dense 2-D numeric region bound to a device.
///
/// Cloning bumps the handle count; the storage is released when the owner
/// and all views are gone (shared ownership subsumes the classic
/// "view must not outlive the owner" rule: a view keeps the allocation
/// alive, but `is_owner` still records which handle allocated it).
pub struct Buffer {
    data: Arc<RwLock<BufferData>>,
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Buffer {
            data: Arc::clone(&self.data),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.read();
        f.debug_struct("Buffer")
            .field("nrows", &d.nrows)
            .field("ncols", &d.ncols)
            .field("dtype", &d.dtype)
            .field("device", &d.device)
            .field("is_owner", &d.is_owner)
            .finish()
    }
}

/// Handle identity, consistent with views being distinct handles over the
/// same storage.
impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
impl Eq for Buffer {}

impl Buffer {
    // -- lifecycle ----------------------------------------------------------

    /// Allocates a zero-initialized `nrows`×`ncols` buffer on `device`.
    ///
    /// # Errors
    /// `InvalidDevice` if the device is not registered.
    pub fn empty_on(
        device: Device,
        nrows: usize,
        ncols: usize,
        dtype: DType,
    ) -> Result<Buffer, FluxRustError> {
        DeviceRegistry::global().validate(device)?;
        let storage = Arc::new(Storage::zeroed(dtype, nrows * ncols));
        Ok(Buffer {
            data: Arc::new(RwLock::new(BufferData {
                storage,
                offset: 0,
                nrows,
                ncols,
                ld: nrows,
                row_capacity: nrows,
                col_capacity: ncols,
                dtype,
                device,
                is_owner: true,
            })),
        })
    }

    /// Like [`Buffer::empty_on`], targeting the thread's current device
    /// (see [`Context::activate`]).
    pub fn empty(nrows: usize, ncols: usize, dtype: DType) -> Result<Buffer, FluxRustError> {
        Buffer::empty_on(current_device(), nrows, ncols, dtype)
    }

    /// Fresh allocation with the same extents and dtype as `self`, on the
    /// same device.
    pub fn empty_like(&self) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        Buffer::empty_on(d.device, d.nrows, d.ncols, d.dtype)
    }

    /// Fresh allocation with the same extents and dtype as `self`, on
    /// `device`.
    pub fn empty_like_on(&self, device: Device) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        Buffer::empty_on(device, d.nrows, d.ncols, d.dtype)
    }

    /// Allocates on `device` and synchronously copies `host` in.
    pub fn from_host<T: Element>(
        device: Device,
        host: &HostMatrix<T>,
    ) -> Result<Buffer, FluxRustError> {
        let buffer = Buffer::empty_on(device, host.nrows(), host.ncols(), T::DTYPE)?;
        {
            let d = buffer.read();
            let span = d.span();
            unsafe {
                for j in 0..span.ncols {
                    for i in 0..span.nrows {
                        *span.ptr_at::<T>(i, j) = host.get(i, j);
                    }
                }
            }
        }
        Ok(buffer)
    }

    // -- accessors ----------------------------------------------------------

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, BufferData> {
        self.data.read().expect("buffer metadata poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, BufferData> {
        self.data.write().expect("buffer metadata poisoned")
    }

    pub fn nrows(&self) -> usize {
        self.read().nrows
    }

    pub fn ncols(&self) -> usize {
        self.read().ncols
    }

    pub fn shape(&self) -> (usize, usize) {
        let d = self.read();
        (d.nrows, d.ncols)
    }

    pub fn nelems(&self) -> usize {
        let d = self.read();
        d.nrows * d.ncols
    }

    pub fn dtype(&self) -> DType {
        self.read().dtype
    }

    pub fn device(&self) -> Device {
        self.read().device
    }

    /// False for views.
    pub fn is_owner(&self) -> bool {
        self.read().is_owner
    }

    pub fn same_shape(&self, other: &Buffer) -> bool {
        self.shape() == other.shape()
    }

    // -- logical extents ----------------------------------------------------

    /// Moves the logical row count without reallocating.
    ///
    /// # Errors
    /// `CapacityExceeded` past the extent fixed at creation.
    pub fn set_nrows(&self, nrows: usize) -> Result<(), FluxRustError> {
        let mut d = self.write();
        if nrows > d.row_capacity {
            return Err(FluxRustError::CapacityExceeded {
                requested: nrows,
                capacity: d.row_capacity,
            });
        }
        d.nrows = nrows;
        Ok(())
    }

    /// Moves the logical column count without reallocating.
    pub fn set_ncols(&self, ncols: usize) -> Result<(), FluxRustError> {
        let mut d = self.write();
        if ncols > d.col_capacity {
            return Err(FluxRustError::CapacityExceeded {
                requested: ncols,
                capacity: d.col_capacity,
            });
        }
        d.ncols = ncols;
        Ok(())
    }

    /// Sets both logical extents at once.
    pub fn set_extents(&self, nrows: usize, ncols: usize) -> Result<(), FluxRustError> {
        self.set_nrows(nrows)?;
        self.set_ncols(ncols)
    }

    // -- views --------------------------------------------------------------

    fn view(&self, offset: usize, nrows: usize, ncols: usize, ld: usize) -> Buffer {
        let d = self.read();
        Buffer {
            data: Arc::new(RwLock::new(BufferData {
                storage: Arc::clone(&d.storage),
                offset,
                nrows,
                ncols,
                ld,
                row_capacity: nrows,
                col_capacity: ncols,
                dtype: d.dtype,
                device: d.device,
                is_owner: false,
            })),
        }
    }

    /// Contiguous view of columns `range`. No copy.
    pub fn cols(&self, range: Range<usize>) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        if range.start > range.end || range.end > d.ncols {
            return Err(FluxRustError::SliceError {
                message: format!(
                    "column range {:?} out of bounds for {} columns",
                    range, d.ncols
                ),
            });
        }
        let offset = d.offset + range.start * d.ld;
        let ncols = range.end - range.start;
        let (nrows, ld) = (d.nrows, d.ld);
        drop(d);
        Ok(self.view(offset, nrows, ncols, ld))
    }

    /// View of the single column `j`.
    pub fn col(&self, j: usize) -> Result<Buffer, FluxRustError> {
        self.cols(j..j + 1)
    }

    /// Strided view of rows `range`. No copy.
    pub fn rows(&self, range: Range<usize>) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        if range.start > range.end || range.end > d.nrows {
            return Err(FluxRustError::SliceError {
                message: format!("row range {:?} out of bounds for {} rows", range, d.nrows),
            });
        }
        let offset = d.offset + range.start;
        let nrows = range.end - range.start;
        let (ncols, ld) = (d.ncols, d.ld);
        drop(d);
        Ok(self.view(offset, nrows, ncols, ld))
    }

    /// View of the single row `i`.
    pub fn row(&self, i: usize) -> Result<Buffer, FluxRustError> {
        self.rows(i..i + 1)
    }

    /// Flattens to an `(nelems, 1)` view. Requires packed columns.
    pub fn ravel(&self) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        if !d.is_contiguous() {
            return Err(FluxRustError::SliceError {
                message: "ravel requires contiguous storage".to_string(),
            });
        }
        let nelems = d.nrows * d.ncols;
        let offset = d.offset;
        drop(d);
        Ok(self.view(offset, nelems, 1, nelems))
    }

    /// Reinterprets the same elements as `nrows`×`ncols`. Requires packed
    /// columns and an identical element count.
    pub fn reshape(&self, nrows: usize, ncols: usize) -> Result<Buffer, FluxRustError> {
        let d = self.read();
        if !d.is_contiguous() {
            return Err(FluxRustError::SliceError {
                message: "reshape requires contiguous storage".to_string(),
            });
        }
        if nrows * ncols != d.nrows * d.ncols {
            return Err(FluxRustError::ShapeMismatch {
                expected: (d.nrows, d.ncols),
                actual: (nrows, ncols),
                operation: "reshape".to_string(),
            });
        }
        let offset = d.offset;
        drop(d);
        Ok(self.view(offset, nrows, ncols, nrows))
    }

    // -- host transfer ------------------------------------------------------

    /// Reads the buffer back into a host matrix.
    ///
    /// This is a direct storage read: when work targeting this buffer is
    /// still in flight the caller must [`Context::synchronize`] the
    /// producing context first; that is the one correctness obligation the
    /// transfer boundary puts on the host.
    ///
    /// # Errors
    /// `TypeMismatch` when `T` does not match the buffer dtype.
    pub fn to_host<T: Element>(&self) -> Result<HostMatrix<T>, FluxRustError> {
        let d = self.read();
        if d.dtype != T::DTYPE {
            return Err(FluxRustError::TypeMismatch {
                expected: d.dtype,
                actual: T::DTYPE,
                operation: "to_host".to_string(),
            });
        }
        let span = d.span();
        let mut host = HostMatrix::<T>::zeros(d.nrows, d.ncols);
        unsafe {
            for j in 0..span.ncols {
                for i in 0..span.nrows {
                    host.set(i, j, span.at::<T>(i, j));
                }
            }
        }
        Ok(host)
    }

    /// Enqueues a host-to-device transfer on `ctx`, adopting the host
    /// matrix's extents (within capacity). The host data is staged at call
    /// time, so the caller may drop or reuse `host` immediately.
    pub fn copy_from_host<T: Element>(
        &self,
        ctx: &Context,
        host: &HostMatrix<T>,
    ) -> Result<(), FluxRustError> {
        let span = {
            let mut d = self.write();
            if d.dtype != T::DTYPE {
                return Err(FluxRustError::TypeMismatch {
                    expected: d.dtype,
                    actual: T::DTYPE,
                    operation: "copy_from_host".to_string(),
                });
            }
            if d.device != ctx.device() {
                return Err(FluxRustError::DeviceMismatch {
                    expected: d.device,
                    actual: ctx.device(),
                    operation: "copy_from_host".to_string(),
                });
            }
            if host.nrows() > d.row_capacity {
                return Err(FluxRustError::CapacityExceeded {
                    requested: host.nrows(),
                    capacity: d.row_capacity,
                });
            }
            if host.ncols() > d.col_capacity {
                return Err(FluxRustError::CapacityExceeded {
                    requested: host.ncols(),
                    capacity: d.col_capacity,
                });
            }
            d.nrows = host.nrows();
            d.ncols = host.ncols();
            d.span()
        };
        let staged: HostMatrix<T> = host.clone();
        ctx.enqueue(move || {
            let data = staged.into_vec();
            unsafe {
                for j in 0..span.ncols {
                    for i in 0..span.nrows {
                        *span.ptr_at::<T>(i, j) = data[j * span.nrows + i];
                    }
                }
            }
        });
        Ok(())
    }

    // -- validation helpers shared by the primitive ops ---------------------

    pub(crate) fn span_as(
        &self,
        dtype: DType,
        ctx: &Context,
        op: &str,
    ) -> Result<Span, FluxRustError> {
        let d = self.read();
        if d.dtype != dtype {
            return Err(FluxRustError::TypeMismatch {
                expected: dtype,
                actual: d.dtype,
                operation: op.to_string(),
            });
        }
        if d.device != ctx.device() {
            return Err(FluxRustError::DeviceMismatch {
                expected: ctx.device(),
                actual: d.device,
                operation: op.to_string(),
            });
        }
        Ok(d.span())
    }

    /// Span snapshot without a device check, for cross-device copies.
    pub(crate) fn span_unchecked_device(
        &self,
        dtype: DType,
        op: &str,
    ) -> Result<Span, FluxRustError> {
        let d = self.read();
        if d.dtype != dtype {
            return Err(FluxRustError::TypeMismatch {
                expected: dtype,
                actual: d.dtype,
                operation: op.to_string(),
            });
        }
        Ok(d.span())
    }
}

pub(crate) fn check_same_shape(
    expected: (usize, usize),
    actual: (usize, usize),
    op: &str,
) -> Result<(), FluxRustError> {
    if expected != actual {
        return Err(FluxRustError::ShapeMismatch {
            expected,
            actual,
            operation: op.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_share_storage_and_never_copy() {
        let buf = Buffer::empty_on(Device::Cpu, 4, 6, DType::F32).unwrap();
        let view = buf.cols(2..5).unwrap();
        assert_eq!(view.shape(), (4, 3));
        assert!(!view.is_owner());
        assert!(buf.is_owner());
    }

    #[test]
    fn ravel_and_reshape_preserve_element_count() {
        let buf = Buffer::empty_on(Device::Cpu, 3, 4, DType::F32).unwrap();
        assert_eq!(buf.ravel().unwrap().shape(), (12, 1));
        assert_eq!(buf.reshape(6, 2).unwrap().shape(), (6, 2));
        assert!(matches!(
            buf.reshape(5, 2),
            Err(FluxRustError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn ravel_of_strided_view_is_rejected() {
        let buf = Buffer::empty_on(Device::Cpu, 4, 4, DType::F32).unwrap();
        let strided = buf.rows(1..3).unwrap();
        assert!(matches!(
            strided.ravel(),
            Err(FluxRustError::SliceError { .. })
        ));
    }

    #[test]
    fn logical_resize_is_bounded_by_creation_extent() {
        let buf = Buffer::empty_on(Device::Cpu, 8, 3, DType::F32).unwrap();
        buf.set_nrows(5).unwrap();
        assert_eq!(buf.shape(), (5, 3));
        buf.set_nrows(8).unwrap();
        assert!(matches!(
            buf.set_nrows(9),
            Err(FluxRustError::CapacityExceeded {
                requested: 9,
                capacity: 8
            })
        ));
    }

    #[test]
    fn host_transfer_checks_element_type() {
        let buf = Buffer::empty_on(Device::Cpu, 2, 2, DType::F32).unwrap();
        let err = buf.to_host::<i32>().unwrap_err();
        assert!(matches!(err, FluxRustError::TypeMismatch { .. }));
    }

    #[test]
    fn out_of_range_slices_fail() {
        let buf = Buffer::empty_on(Device::Cpu, 2, 2, DType::F32).unwrap();
        assert!(buf.cols(1..3).is_err());
        assert!(buf.rows(0..3).is_err());
    }

    #[test]
    fn device_defaulting_factory_follows_the_activated_context() {
        use crate::context::Context;
        let ctx = Context::new(Device::Accel(0)).unwrap();
        ctx.activate();
        let buf = Buffer::empty(2, 2, DType::F32).unwrap();
        assert_eq!(buf.device(), Device::Accel(0));
        Context::new(Device::Cpu).unwrap().activate();
        let buf = Buffer::empty(2, 2, DType::F32).unwrap();
        assert_eq!(buf.device(), Device::Cpu);
    }
}
