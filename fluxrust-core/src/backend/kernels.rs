//! Structural and elementwise kernels.

use rand::Rng;

use crate::registry::NnHandle;
use crate::storage::Span;
use crate::types::Element;

/// `dst = src`, elementwise over identical extents.
pub(crate) fn copy<T: Element>(src: &Span, dst: &Span) {
    debug_assert_eq!(src.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<T>(i, j) = src.at::<T>(i, j);
            }
        }
    }
}

/// Flat storage-order copy between two contiguous spans of equal element
/// count; the extents themselves may differ (reshape-style transfer).
pub(crate) fn copy_flat<T: Element>(src: &Span, dst: &Span) {
    debug_assert!(src.contiguous() && dst.contiguous());
    debug_assert_eq!(src.nelems(), dst.nelems());
    let n = src.nelems();
    if n == 0 {
        return;
    }
    unsafe {
        let s = src.ptr_at::<T>(0, 0);
        let d = dst.ptr_at::<T>(0, 0);
        for k in 0..n {
            *d.add(k) = *s.add(k);
        }
    }
}

pub(crate) fn fill<T: Element>(dst: &Span, value: T) {
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<T>(i, j) = value;
            }
        }
    }
}

/// `dst = alpha * src`.
pub(crate) fn scale(alpha: f32, src: &Span, dst: &Span) {
    debug_assert_eq!(src.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) = alpha * src.at::<f32>(i, j);
            }
        }
    }
}

/// `dst = alpha * (a + b)`.
pub(crate) fn scaled_addition(alpha: f32, a: &Span, b: &Span, dst: &Span) {
    debug_assert_eq!(a.shape(), dst.shape());
    debug_assert_eq!(b.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) = alpha * (a.at::<f32>(i, j) + b.at::<f32>(i, j));
            }
        }
    }
}

/// `dst = alpha * (a - b)`.
pub(crate) fn scaled_subtraction(alpha: f32, a: &Span, b: &Span, dst: &Span) {
    debug_assert_eq!(a.shape(), dst.shape());
    debug_assert_eq!(b.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) = alpha * (a.at::<f32>(i, j) - b.at::<f32>(i, j));
            }
        }
    }
}

/// `dst[i, j] += alpha * row[0, j]`.
pub(crate) fn row_broadcast_add_scaled(alpha: f32, row: &Span, dst: &Span) {
    debug_assert_eq!(row.nrows, 1);
    debug_assert_eq!(row.ncols, dst.ncols);
    unsafe {
        for j in 0..dst.ncols {
            let v = alpha * row.at::<f32>(0, j);
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) += v;
            }
        }
    }
}

/// `dst[i, j] += alpha * col[i, 0]`.
pub(crate) fn col_broadcast_add_scaled(alpha: f32, col: &Span, dst: &Span) {
    debug_assert_eq!(col.ncols, 1);
    debug_assert_eq!(col.nrows, dst.nrows);
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) += alpha * col.at::<f32>(i, 0);
            }
        }
    }
}

/// `dst[i, j] *= col[i, 0]`.
pub(crate) fn col_broadcast_hprod(col: &Span, dst: &Span) {
    debug_assert_eq!(col.ncols, 1);
    debug_assert_eq!(col.nrows, dst.nrows);
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) *= col.at::<f32>(i, 0);
            }
        }
    }
}

/// `dst[i, j] *= row[0, j]`.
pub(crate) fn row_broadcast_hprod(row: &Span, dst: &Span) {
    debug_assert_eq!(row.nrows, 1);
    debug_assert_eq!(row.ncols, dst.ncols);
    unsafe {
        for j in 0..dst.ncols {
            let v = row.at::<f32>(0, j);
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) *= v;
            }
        }
    }
}

/// `dst = a .* b + alpha * dst`.
pub(crate) fn add_hprod2(a: &Span, b: &Span, alpha: f32, dst: &Span) {
    debug_assert_eq!(a.shape(), dst.shape());
    debug_assert_eq!(b.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let prev = dst.at::<f32>(i, j);
                *dst.ptr_at::<f32>(i, j) = a.at::<f32>(i, j) * b.at::<f32>(i, j) + alpha * prev;
            }
        }
    }
}

/// `dst = a .* b .* c + alpha * dst`.
pub(crate) fn add_hprod3(a: &Span, b: &Span, c: &Span, alpha: f32, dst: &Span) {
    debug_assert_eq!(a.shape(), dst.shape());
    debug_assert_eq!(b.shape(), dst.shape());
    debug_assert_eq!(c.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let prev = dst.at::<f32>(i, j);
                *dst.ptr_at::<f32>(i, j) =
                    a.at::<f32>(i, j) * b.at::<f32>(i, j) * c.at::<f32>(i, j) + alpha * prev;
            }
        }
    }
}

/// `dst = src * (mask != 0)`.
pub(crate) fn mask_zeros(src: &Span, mask: &Span, dst: &Span) {
    debug_assert_eq!(src.shape(), dst.shape());
    debug_assert_eq!(mask.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let keep = mask.at::<f32>(i, j) != 0.0;
                *dst.ptr_at::<f32>(i, j) = if keep { src.at::<f32>(i, j) } else { 0.0 };
            }
        }
    }
}

/// `dst[i, j] = (j < lengths[i, 0]) as f32`.
pub(crate) fn sequence_mask(lengths: &Span, dst: &Span) {
    debug_assert_eq!(lengths.ncols, 1);
    debug_assert_eq!(lengths.nrows, dst.nrows);
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let active = (j as i32) < lengths.at::<i32>(i, 0);
                *dst.ptr_at::<f32>(i, j) = if active { 1.0 } else { 0.0 };
            }
        }
    }
}

/// Column gather: `dst[:, j] = src[:, indices[j, 0]]`.
pub(crate) fn slice_columns(indices: &Span, src: &Span, dst: &Span) {
    debug_assert_eq!(indices.ncols, 1);
    debug_assert_eq!(indices.nrows, dst.ncols);
    debug_assert_eq!(src.nrows, dst.nrows);
    unsafe {
        for j in 0..dst.ncols {
            let src_col = indices.at::<i32>(j, 0) as usize;
            debug_assert!(src_col < src.ncols);
            for i in 0..dst.nrows {
                *dst.ptr_at::<f32>(i, j) = src.at::<f32>(i, src_col);
            }
        }
    }
}

/// Column scatter-add: `dst[:, indices[j, 0]] += alpha * src[:, j]`.
pub(crate) fn sliced_columns_add_scaled(indices: &Span, alpha: f32, src: &Span, dst: &Span) {
    debug_assert_eq!(indices.ncols, 1);
    debug_assert_eq!(indices.nrows, src.ncols);
    debug_assert_eq!(src.nrows, dst.nrows);
    unsafe {
        for j in 0..src.ncols {
            let dst_col = indices.at::<i32>(j, 0) as usize;
            debug_assert!(dst_col < dst.ncols);
            for i in 0..src.nrows {
                *dst.ptr_at::<f32>(i, dst_col) += alpha * src.at::<f32>(i, j);
            }
        }
    }
}

/// Row gather: `dst[i, :] = src[indices[i, 0], :]`.
pub(crate) fn slice_rows(indices: &Span, src: &Span, dst: &Span) {
    debug_assert_eq!(indices.ncols, 1);
    debug_assert_eq!(indices.nrows, dst.nrows);
    debug_assert_eq!(src.ncols, dst.ncols);
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let src_row = indices.at::<i32>(i, 0) as usize;
                debug_assert!(src_row < src.nrows);
                *dst.ptr_at::<f32>(i, j) = src.at::<f32>(src_row, j);
            }
        }
    }
}

/// Packs `parts` side by side into `dst`.
pub(crate) fn horizontal_stack(parts: &[Span], dst: &Span) {
    let mut offset = 0;
    unsafe {
        for part in parts {
            debug_assert_eq!(part.nrows, dst.nrows);
            for j in 0..part.ncols {
                for i in 0..part.nrows {
                    *dst.ptr_at::<f32>(i, offset + j) = part.at::<f32>(i, j);
                }
            }
            offset += part.ncols;
        }
    }
    debug_assert_eq!(offset, dst.ncols);
}

/// Splits `src` column-wise into `parts`.
pub(crate) fn horizontal_split(src: &Span, parts: &[Span]) {
    let mut offset = 0;
    unsafe {
        for part in parts {
            debug_assert_eq!(part.nrows, src.nrows);
            for j in 0..part.ncols {
                for i in 0..part.nrows {
                    *part.ptr_at::<f32>(i, j) = src.at::<f32>(i, offset + j);
                }
            }
            offset += part.ncols;
        }
    }
    debug_assert_eq!(offset, src.ncols);
}

/// Packs `parts` on top of each other into `dst`.
pub(crate) fn vertical_stack(parts: &[Span], dst: &Span) {
    let mut offset = 0;
    unsafe {
        for part in parts {
            debug_assert_eq!(part.ncols, dst.ncols);
            for j in 0..part.ncols {
                for i in 0..part.nrows {
                    *dst.ptr_at::<f32>(offset + i, j) = part.at::<f32>(i, j);
                }
            }
            offset += part.nrows;
        }
    }
    debug_assert_eq!(offset, dst.nrows);
}

/// Splits `src` row-wise into `parts`.
pub(crate) fn vertical_split(src: &Span, parts: &[Span]) {
    let mut offset = 0;
    unsafe {
        for part in parts {
            debug_assert_eq!(part.ncols, src.ncols);
            for j in 0..part.ncols {
                for i in 0..part.nrows {
                    *part.ptr_at::<f32>(i, j) = src.at::<f32>(offset + i, j);
                }
            }
            offset += part.nrows;
        }
    }
    debug_assert_eq!(offset, src.nrows);
}

/// `dst += parts[0] + parts[1] + …`, all extents identical.
pub(crate) fn add_sum(parts: &[Span], dst: &Span) {
    unsafe {
        for part in parts {
            debug_assert_eq!(part.shape(), dst.shape());
            for j in 0..dst.ncols {
                for i in 0..dst.nrows {
                    *dst.ptr_at::<f32>(i, j) += part.at::<f32>(i, j);
                }
            }
        }
    }
}

/// `dst = parts[0] + parts[1] + …`.
pub(crate) fn assign_sum(parts: &[Span], dst: &Span) {
    fill(dst, 0.0f32);
    add_sum(parts, dst);
}

/// The combined softmax + cross-entropy gradient for integer class labels:
/// `dst[i, j] += (probs[i, j] - [j == labels[i, 0]]) / nrows`.
pub(crate) fn add_softmax_ce_derivative(probs: &Span, labels: &Span, dst: &Span) {
    debug_assert_eq!(probs.shape(), dst.shape());
    debug_assert_eq!(labels.ncols, 1);
    debug_assert_eq!(labels.nrows, probs.nrows);
    let inv_batch = 1.0 / probs.nrows as f32;
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let target = if labels.at::<i32>(i, 0) as usize == j {
                    1.0
                } else {
                    0.0
                };
                *dst.ptr_at::<f32>(i, j) += (probs.at::<f32>(i, j) - target) * inv_batch;
            }
        }
    }
}

/// `dst = src * (uniform >= prob)`, sampling from the device generator.
pub(crate) fn dropout(handle: &mut NnHandle, prob: f32, src: &Span, dst: &Span) {
    debug_assert_eq!(src.shape(), dst.shape());
    unsafe {
        for j in 0..dst.ncols {
            for i in 0..dst.nrows {
                let u: f32 = handle.rng.gen();
                let v = if u < prob { 0.0 } else { src.at::<f32>(i, j) };
                *dst.ptr_at::<f32>(i, j) = v;
            }
        }
    }
}
