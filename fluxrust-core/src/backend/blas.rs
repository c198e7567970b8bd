//! Dense linear-algebra kernels over column-major spans.

use crate::registry::BlasHandle;
use crate::storage::Span;
use crate::types::Trans;

/// `x *= alpha`.
pub(crate) fn scal(alpha: f32, x: &Span) {
    unsafe {
        for j in 0..x.ncols {
            for i in 0..x.nrows {
                *x.ptr_at::<f32>(i, j) *= alpha;
            }
        }
    }
}

/// `y += alpha * x`, elementwise over identical extents.
pub(crate) fn axpy(alpha: f32, x: &Span, y: &Span) {
    debug_assert_eq!(x.shape(), y.shape());
    unsafe {
        for j in 0..y.ncols {
            for i in 0..y.nrows {
                *y.ptr_at::<f32>(i, j) += alpha * x.at::<f32>(i, j);
            }
        }
    }
}

fn op_dims(trans: Trans, m: &Span) -> (usize, usize) {
    match trans {
        Trans::N => (m.nrows, m.ncols),
        Trans::T => (m.ncols, m.nrows),
    }
}

/// `c = alpha * op(a) * op(b) + beta * c`.
///
/// When `c` shares an allocation with either operand the product is staged
/// in the handle's workspace first, so the read side never observes
/// half-written output.
pub(crate) fn gemm(
    handle: &mut BlasHandle,
    trans_a: Trans,
    trans_b: Trans,
    alpha: f32,
    a: &Span,
    b: &Span,
    beta: f32,
    c: &Span,
) {
    let (m, ka) = op_dims(trans_a, a);
    let (kb, n) = op_dims(trans_b, b);
    debug_assert_eq!(ka, kb);
    debug_assert_eq!((m, n), c.shape());
    let k = ka;

    let read_a = |i: usize, l: usize| unsafe {
        match trans_a {
            Trans::N => a.at::<f32>(i, l),
            Trans::T => a.at::<f32>(l, i),
        }
    };
    let read_b = |l: usize, j: usize| unsafe {
        match trans_b {
            Trans::N => b.at::<f32>(l, j),
            Trans::T => b.at::<f32>(j, l),
        }
    };

    if c.aliases(a) || c.aliases(b) {
        let staged = handle.workspace(m * n);
        for j in 0..n {
            for i in 0..m {
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += read_a(i, l) * read_b(l, j);
                }
                staged[j * m + i] = acc;
            }
        }
        unsafe {
            for j in 0..n {
                for i in 0..m {
                    let prev = c.at::<f32>(i, j);
                    *c.ptr_at::<f32>(i, j) = alpha * staged[j * m + i] + beta * prev;
                }
            }
        }
    } else {
        unsafe {
            for j in 0..n {
                for i in 0..m {
                    let mut acc = 0.0f32;
                    for l in 0..k {
                        acc += read_a(i, l) * read_b(l, j);
                    }
                    let prev = c.at::<f32>(i, j);
                    *c.ptr_at::<f32>(i, j) = alpha * acc + beta * prev;
                }
            }
        }
    }
}
