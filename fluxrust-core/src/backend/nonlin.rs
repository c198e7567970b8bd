//! Nonlinearity kernels, each with an optional fused derivative output.

use crate::registry::NnHandle;
use crate::storage::Span;

fn map(src: &Span, dst: &Span, f: impl Fn(f32) -> f32) {
    debug_assert_eq!(src.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) = f(src.at::<f32>(i, j));
            }
        }
    }
}

fn map_with_derivative(
    src: &Span,
    dst: &Span,
    der: &Span,
    f: impl Fn(f32) -> (f32, f32),
) {
    debug_assert_eq!(src.shape(), dst.shape());
    debug_assert_eq!(src.shape(), der.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let (value, slope) = f(src.at::<f32>(i, j));
                *dst.ptr_at::<f32>(i, j) = value;
                *der.ptr_at::<f32>(i, j) = slope;
            }
        }
    }
}

pub(crate) fn tanh(src: &Span, dst: &Span) {
    map(src, dst, f32::tanh);
}

pub(crate) fn tanh_der(src: &Span, dst: &Span, der: &Span) {
    map_with_derivative(src, dst, der, |x| {
        let t = x.tanh();
        (t, 1.0 - t * t)
    });
}

fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn sigmoid(src: &Span, dst: &Span) {
    map(src, dst, sigmoid_scalar);
}

pub(crate) fn sigmoid_der(src: &Span, dst: &Span, der: &Span) {
    map_with_derivative(src, dst, der, |x| {
        let s = sigmoid_scalar(x);
        (s, s * (1.0 - s))
    });
}

pub(crate) fn relu(src: &Span, dst: &Span) {
    map(src, dst, |x| x.max(0.0));
}

pub(crate) fn relu_der(src: &Span, dst: &Span, der: &Span) {
    map_with_derivative(src, dst, der, |x| {
        if x > 0.0 {
            (x, 1.0)
        } else {
            (0.0, 0.0)
        }
    });
}

/// Row-wise softmax: each row is one instance, normalized across columns.
/// Uses the device handle's row scratch so the strided row walk happens
/// once per row.
pub(crate) fn softmax(handle: &mut NnHandle, src: &Span, dst: &Span) {
    debug_assert_eq!(src.shape(), dst.shape());
    let row = handle.row_scratch(src.ncols);
    unsafe {
        for i in 0..src.nrows {
            for j in 0..src.ncols {
                row[j] = src.at::<f32>(i, j);
            }
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                total += *v;
            }
            for (j, v) in row.iter().enumerate() {
                *dst.ptr_at::<f32>(i, j) = v / total;
            }
        }
    }
}
