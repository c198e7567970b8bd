//! Dense storage shared between an owning buffer and its views.
//!
//! A `Storage` plays the role of a raw device allocation: several `Buffer`
//! handles (the owner plus any number of views) may reference overlapping
//! regions of the same allocation, and kernels enqueued on different contexts
//! may read and write those regions concurrently. The engine never hands a
//! `&mut` over this memory; ordering of conflicting access is established
//! exclusively by the `wait`/`block` edges between contexts, exactly as it
//! would be for real device memory. That contract is what makes the `unsafe`
//! accessors below sound: a kernel only touches a span after the queue it
//! runs on has been ordered after every producer of that span.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use crate::types::{DType, Element};

pub(crate) struct RawVec<T> {
    data: UnsafeCell<Box<[T]>>,
}

// Mutation is externally ordered by context synchronization (see module doc).
unsafe impl<T: Send> Send for RawVec<T> {}
unsafe impl<T: Send + Sync> Sync for RawVec<T> {}

impl<T: Element> RawVec<T> {
    fn zeroed(len: usize) -> Self {
        RawVec {
            data: UnsafeCell::new(vec![T::zero(); len].into_boxed_slice()),
        }
    }

    fn len(&self) -> usize {
        unsafe { (&(*self.data.get())).len() }
    }

    fn as_ptr(&self) -> *mut T {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }
}

/// Dtype-tagged dense allocation. One `Storage` is created per owning
/// `Buffer`; views share it through the surrounding `Arc`.
pub(crate) enum Storage {
    F32(RawVec<f32>),
    I32(RawVec<i32>),
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("dtype", &self.dtype())
            .field("len", &self.len())
            .finish()
    }
}

impl Storage {
    pub(crate) fn zeroed(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(RawVec::zeroed(len)),
            DType::I32 => Storage::I32(RawVec::zeroed(len)),
        }
    }

    pub(crate) fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::I32(_) => DType::I32,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::I32(v) => v.len(),
        }
    }

    /// Raw element pointer. The caller must have checked the dtype at
    /// enqueue time; a mismatch here is an engine bug, not a user error.
    fn as_ptr<T: Element>(&self) -> *mut T {
        match (self, T::DTYPE) {
            (Storage::F32(v), DType::F32) => v.as_ptr() as *mut T,
            (Storage::I32(v), DType::I32) => v.as_ptr() as *mut T,
            (s, requested) => unreachable!(
                "storage dtype {:?} accessed as {:?}",
                s.dtype(),
                requested
            ),
        }
    }
}

/// A concrete rectangular window into a `Storage`, snapshotted at enqueue
/// time: kernels receive `Span`s, never `Buffer` handles, so a logical
/// resize between enqueue and execution cannot change what an already
/// enqueued kernel touches.
///
/// Layout is column-major: element `(i, j)` lives at
/// `offset + j * ld + i`, with `ld` the leading dimension.
#[derive(Clone, Debug)]
pub(crate) struct Span {
    pub(crate) storage: Arc<Storage>,
    pub(crate) offset: usize,
    pub(crate) nrows: usize,
    pub(crate) ncols: usize,
    pub(crate) ld: usize,
}

impl Span {
    pub(crate) fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub(crate) fn nelems(&self) -> usize {
        self.nrows * self.ncols
    }

    /// True when the columns are packed back to back.
    pub(crate) fn contiguous(&self) -> bool {
        self.ld == self.nrows || self.ncols <= 1
    }

    /// Whether two spans are backed by the same allocation.
    pub(crate) fn aliases(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Element read used by kernels and host transfer.
    ///
    /// # Safety
    /// Caller must run on the queue that owns this access (see module doc).
    pub(crate) unsafe fn at<T: Element>(&self, i: usize, j: usize) -> T {
        *self.ptr_at::<T>(i, j)
    }

    /// Raw pointer to element `(i, j)`. Kernels go through raw pointers
    /// rather than slices so in-place updates with aliased operands stay
    /// well-defined.
    ///
    /// # Safety
    /// Same contract as [`Span::at`].
    pub(crate) unsafe fn ptr_at<T: Element>(&self, i: usize, j: usize) -> *mut T {
        debug_assert!(i < self.nrows && j < self.ncols);
        self.storage.as_ptr::<T>().add(self.offset + j * self.ld + i)
    }
}
