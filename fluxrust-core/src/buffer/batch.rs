//! Batched multi-buffer operations and gather/scatter.
//!
//! The batched operations (stacking, splitting, summing a set of buffers)
//! route their per-part descriptors through the context's scratch pool, so
//! back-to-back batched calls on one queue reuse a single grow-only table
//! instead of allocating per kernel.

use super::{check_same_shape, Buffer};
use crate::backend::kernels;
use crate::context::Context;
use crate::error::FluxRustError;
use crate::storage::Span;
use crate::types::DType;

fn part_spans(
    parts: &[&Buffer],
    ctx: &Context,
    op: &str,
) -> Result<Vec<Span>, FluxRustError> {
    if parts.is_empty() {
        return Err(FluxRustError::Configuration {
            message: format!("{}: empty buffer list", op),
        });
    }
    parts
        .iter()
        .map(|part| part.span_as(DType::F32, ctx, op))
        .collect()
}

impl Buffer {
    /// `self = [parts[0] | parts[1] | …]`, columns side by side.
    pub fn assign_hstack(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "assign_hstack")?;
        let spans = part_spans(parts, ctx, "assign_hstack")?;
        let mut ncols = 0;
        for span in &spans {
            check_same_shape((dst.nrows, span.ncols), span.shape(), "assign_hstack")?;
            ncols += span.ncols;
        }
        if ncols != dst.ncols {
            return Err(FluxRustError::ShapeMismatch {
                expected: (dst.nrows, dst.ncols),
                actual: (dst.nrows, ncols),
                operation: "assign_hstack".to_string(),
            });
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::horizontal_stack(&table, &dst);
        });
        Ok(())
    }

    /// Splits this buffer's columns into `parts`, in order.
    pub fn hsplit(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, "hsplit")?;
        let spans = part_spans(parts, ctx, "hsplit")?;
        let mut ncols = 0;
        for span in &spans {
            check_same_shape((src.nrows, span.ncols), span.shape(), "hsplit")?;
            ncols += span.ncols;
        }
        if ncols != src.ncols {
            return Err(FluxRustError::ShapeMismatch {
                expected: (src.nrows, src.ncols),
                actual: (src.nrows, ncols),
                operation: "hsplit".to_string(),
            });
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::horizontal_split(&src, &table);
        });
        Ok(())
    }

    /// `self = [parts[0]; parts[1]; …]`, rows stacked.
    pub fn assign_vstack(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "assign_vstack")?;
        let spans = part_spans(parts, ctx, "assign_vstack")?;
        let mut nrows = 0;
        for span in &spans {
            check_same_shape((span.nrows, dst.ncols), span.shape(), "assign_vstack")?;
            nrows += span.nrows;
        }
        if nrows != dst.nrows {
            return Err(FluxRustError::ShapeMismatch {
                expected: (dst.nrows, dst.ncols),
                actual: (nrows, dst.ncols),
                operation: "assign_vstack".to_string(),
            });
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::vertical_stack(&table, &dst);
        });
        Ok(())
    }

    /// Splits this buffer's rows into `parts`, in order.
    pub fn vsplit(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, "vsplit")?;
        let spans = part_spans(parts, ctx, "vsplit")?;
        let mut nrows = 0;
        for span in &spans {
            check_same_shape((span.nrows, src.ncols), span.shape(), "vsplit")?;
            nrows += span.nrows;
        }
        if nrows != src.nrows {
            return Err(FluxRustError::ShapeMismatch {
                expected: (src.nrows, src.ncols),
                actual: (nrows, src.ncols),
                operation: "vsplit".to_string(),
            });
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::vertical_split(&src, &table);
        });
        Ok(())
    }

    /// `self += parts[0] + parts[1] + …`.
    pub fn add_sum(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "add_sum")?;
        let spans = part_spans(parts, ctx, "add_sum")?;
        for span in &spans {
            check_same_shape(dst.shape(), span.shape(), "add_sum")?;
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::add_sum(&table, &dst);
        });
        Ok(())
    }

    /// `self = parts[0] + parts[1] + …`.
    pub fn assign_sum(&self, ctx: &Context, parts: &[&Buffer]) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "assign_sum")?;
        let spans = part_spans(parts, ctx, "assign_sum")?;
        for span in &spans {
            check_same_shape(dst.shape(), span.shape(), "assign_sum")?;
        }
        let pool = ctx.scratch();
        ctx.enqueue(move || {
            let table = pool.load(&spans);
            kernels::assign_sum(&table, &dst);
        });
        Ok(())
    }

    /// Column gather, `out[:, j] = self[:, indices[j]]`, `self` being the
    /// source table. Index values are read on the queue; out-of-range
    /// indices are a driver bug, checked in debug builds only.
    pub fn slice_columns(
        &self,
        ctx: &Context,
        indices: &Buffer,
        out: &Buffer,
    ) -> Result<(), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, "slice_columns")?;
        let idx = indices.span_as(DType::I32, ctx, "slice_columns")?;
        let dst = out.span_as(DType::F32, ctx, "slice_columns")?;
        check_same_shape((dst.ncols, 1), idx.shape(), "slice_columns")?;
        if src.nrows != dst.nrows {
            return Err(FluxRustError::ShapeMismatch {
                expected: (src.nrows, dst.ncols),
                actual: dst.shape(),
                operation: "slice_columns".to_string(),
            });
        }
        ctx.enqueue(move || kernels::slice_columns(&idx, &src, &dst));
        Ok(())
    }

    /// Column scatter-add, `self[:, indices[j]] += alpha * a[:, j]`,
    /// `self` being the destination table.
    pub fn add_columns_scaled(
        &self,
        ctx: &Context,
        indices: &Buffer,
        alpha: f32,
        a: &Buffer,
    ) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "add_columns_scaled")?;
        let idx = indices.span_as(DType::I32, ctx, "add_columns_scaled")?;
        let src = a.span_as(DType::F32, ctx, "add_columns_scaled")?;
        check_same_shape((src.ncols, 1), idx.shape(), "add_columns_scaled")?;
        if src.nrows != dst.nrows {
            return Err(FluxRustError::ShapeMismatch {
                expected: (dst.nrows, src.ncols),
                actual: src.shape(),
                operation: "add_columns_scaled".to_string(),
            });
        }
        ctx.enqueue(move || kernels::sliced_columns_add_scaled(&idx, alpha, &src, &dst));
        Ok(())
    }

    /// Row gather: `out[i, :] = self[indices[i], :]`.
    pub fn slice_rows(
        &self,
        ctx: &Context,
        indices: &Buffer,
        out: &Buffer,
    ) -> Result<(), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, "slice_rows")?;
        let idx = indices.span_as(DType::I32, ctx, "slice_rows")?;
        let dst = out.span_as(DType::F32, ctx, "slice_rows")?;
        check_same_shape((dst.nrows, 1), idx.shape(), "slice_rows")?;
        if src.ncols != dst.ncols {
            return Err(FluxRustError::ShapeMismatch {
                expected: (dst.nrows, src.ncols),
                actual: dst.shape(),
                operation: "slice_rows".to_string(),
            });
        }
        ctx.enqueue(move || kernels::slice_rows(&idx, &src, &dst));
        Ok(())
    }
}
