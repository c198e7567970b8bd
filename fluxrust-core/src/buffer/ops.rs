//! Primitive operations on buffers.
//!
//! Every method here follows the same contract: validate shapes, dtypes and
//! devices synchronously, then enqueue the kernel on the given context and
//! return immediately. A call that returns `Ok(())` has enqueued exactly one
//! kernel; a call that errors has enqueued nothing and changed no state.

use super::{check_same_shape, Buffer};
use crate::backend::{blas, kernels, nonlin};
use crate::context::Context;
use crate::error::FluxRustError;
use crate::storage::Span;
use crate::types::{DType, Element, Trans};

impl Buffer {
    /// `self = value`, every element.
    pub fn fill<T: Element>(&self, ctx: &Context, value: T) -> Result<(), FluxRustError> {
        let dst = self.span_as(T::DTYPE, ctx, "fill")?;
        ctx.enqueue(move || kernels::fill(&dst, value));
        Ok(())
    }

    /// `out = self`. The one primitive that crosses devices: source and
    /// destination may live anywhere, the copy is ordered on `ctx`.
    /// Extents must match elementwise, or, for reshape-style transfers,
    /// both sides must be contiguous with equal element counts.
    pub fn copy_to(&self, ctx: &Context, out: &Buffer) -> Result<(), FluxRustError> {
        let dtype = self.dtype();
        let src = self.span_unchecked_device(dtype, "copy_to")?;
        let dst = out.span_unchecked_device(dtype, "copy_to")?;
        let flat = if src.shape() == dst.shape() {
            false
        } else if src.nelems() == dst.nelems() && src.contiguous() && dst.contiguous() {
            true
        } else {
            return Err(FluxRustError::ShapeMismatch {
                expected: src.shape(),
                actual: dst.shape(),
                operation: "copy_to".to_string(),
            });
        };
        ctx.enqueue(move || match (dtype, flat) {
            (DType::F32, false) => kernels::copy::<f32>(&src, &dst),
            (DType::F32, true) => kernels::copy_flat::<f32>(&src, &dst),
            (DType::I32, false) => kernels::copy::<i32>(&src, &dst),
            (DType::I32, true) => kernels::copy_flat::<i32>(&src, &dst),
        });
        Ok(())
    }

    /// `self *= alpha`, or `out = alpha * self` when `out` is given.
    pub fn scale(
        &self,
        ctx: &Context,
        alpha: f32,
        out: Option<&Buffer>,
    ) -> Result<(), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, "scale")?;
        match out {
            None => ctx.enqueue(move || blas::scal(alpha, &src)),
            Some(out) => {
                let dst = out.span_as(DType::F32, ctx, "scale")?;
                check_same_shape(src.shape(), dst.shape(), "scale")?;
                ctx.enqueue(move || kernels::scale(alpha, &src, &dst));
            }
        }
        Ok(())
    }

    /// `self += alpha * a`.
    ///
    /// `a` may broadcast along one axis: a single row against this buffer's
    /// rows, or a single column against its columns. Any other shape
    /// difference is a synchronous error.
    pub fn add_scaled(&self, ctx: &Context, alpha: f32, a: &Buffer) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "add_scaled")?;
        let src = a.span_as(DType::F32, ctx, "add_scaled")?;
        if src.shape() == dst.shape() {
            ctx.enqueue(move || blas::axpy(alpha, &src, &dst));
        } else if src.nrows == 1 && src.ncols == dst.ncols {
            ctx.enqueue(move || kernels::row_broadcast_add_scaled(alpha, &src, &dst));
        } else if src.ncols == 1 && src.nrows == dst.nrows {
            ctx.enqueue(move || kernels::col_broadcast_add_scaled(alpha, &src, &dst));
        } else {
            return Err(FluxRustError::BroadcastError {
                lhs: dst.shape(),
                rhs: src.shape(),
                operation: "add_scaled".to_string(),
            });
        }
        Ok(())
    }

    /// `self += a`.
    pub fn add(&self, ctx: &Context, a: &Buffer) -> Result<(), FluxRustError> {
        self.add_scaled(ctx, 1.0, a)
    }

    /// `self -= a`.
    pub fn sub(&self, ctx: &Context, a: &Buffer) -> Result<(), FluxRustError> {
        self.add_scaled(ctx, -1.0, a)
    }

    fn ternary_spans(
        &self,
        ctx: &Context,
        a: &Buffer,
        b: &Buffer,
        op: &str,
    ) -> Result<(Span, Span, Span), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, op)?;
        let sa = a.span_as(DType::F32, ctx, op)?;
        let sb = b.span_as(DType::F32, ctx, op)?;
        check_same_shape(dst.shape(), sa.shape(), op)?;
        check_same_shape(dst.shape(), sb.shape(), op)?;
        Ok((dst, sa, sb))
    }

    /// `self = alpha * (a + b)`.
    pub fn assign_scaled_addition(
        &self,
        ctx: &Context,
        alpha: f32,
        a: &Buffer,
        b: &Buffer,
    ) -> Result<(), FluxRustError> {
        let (dst, sa, sb) = self.ternary_spans(ctx, a, b, "assign_scaled_addition")?;
        ctx.enqueue(move || kernels::scaled_addition(alpha, &sa, &sb, &dst));
        Ok(())
    }

    /// `self = a + b`.
    pub fn assign_add(&self, ctx: &Context, a: &Buffer, b: &Buffer) -> Result<(), FluxRustError> {
        self.assign_scaled_addition(ctx, 1.0, a, b)
    }

    /// `self = alpha * (a - b)`.
    pub fn assign_scaled_subtraction(
        &self,
        ctx: &Context,
        alpha: f32,
        a: &Buffer,
        b: &Buffer,
    ) -> Result<(), FluxRustError> {
        let (dst, sa, sb) = self.ternary_spans(ctx, a, b, "assign_scaled_subtraction")?;
        ctx.enqueue(move || kernels::scaled_subtraction(alpha, &sa, &sb, &dst));
        Ok(())
    }

    /// `self = self .* a`, with the single-row/single-column broadcast
    /// exception.
    pub fn hprod(&self, ctx: &Context, a: &Buffer) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "hprod")?;
        let src = a.span_as(DType::F32, ctx, "hprod")?;
        if src.shape() == dst.shape() {
            let dst2 = dst.clone();
            ctx.enqueue(move || kernels::add_hprod2(&dst2, &src, 0.0, &dst));
        } else if src.ncols == 1 && src.nrows == dst.nrows {
            ctx.enqueue(move || kernels::col_broadcast_hprod(&src, &dst));
        } else if src.nrows == 1 && src.ncols == dst.ncols {
            ctx.enqueue(move || kernels::row_broadcast_hprod(&src, &dst));
        } else {
            return Err(FluxRustError::BroadcastError {
                lhs: dst.shape(),
                rhs: src.shape(),
                operation: "hprod".to_string(),
            });
        }
        Ok(())
    }

    /// `self = a .* b` or `self = a .* b .* c`.
    pub fn assign_hprod(
        &self,
        ctx: &Context,
        a: &Buffer,
        b: &Buffer,
        c: Option<&Buffer>,
    ) -> Result<(), FluxRustError> {
        let (dst, sa, sb) = self.ternary_spans(ctx, a, b, "assign_hprod")?;
        match c {
            None => ctx.enqueue(move || kernels::add_hprod2(&sa, &sb, 0.0, &dst)),
            Some(c) => {
                let sc = c.span_as(DType::F32, ctx, "assign_hprod")?;
                check_same_shape(dst.shape(), sc.shape(), "assign_hprod")?;
                ctx.enqueue(move || kernels::add_hprod3(&sa, &sb, &sc, 0.0, &dst));
            }
        }
        Ok(())
    }

    /// `self = a .* b + alpha * self`.
    pub fn add_hprod(
        &self,
        ctx: &Context,
        a: &Buffer,
        b: &Buffer,
        alpha: f32,
    ) -> Result<(), FluxRustError> {
        let (dst, sa, sb) = self.ternary_spans(ctx, a, b, "add_hprod")?;
        ctx.enqueue(move || kernels::add_hprod2(&sa, &sb, alpha, &dst));
        Ok(())
    }

    /// `self = alpha * op(a) * op(b) + beta * self`.
    pub fn add_dot(
        &self,
        ctx: &Context,
        a: &Buffer,
        b: &Buffer,
        trans_a: Trans,
        trans_b: Trans,
        alpha: f32,
        beta: f32,
    ) -> Result<(), FluxRustError> {
        let c = self.span_as(DType::F32, ctx, "add_dot")?;
        let sa = a.span_as(DType::F32, ctx, "add_dot")?;
        let sb = b.span_as(DType::F32, ctx, "add_dot")?;
        let (m, ka) = match trans_a {
            Trans::N => sa.shape(),
            Trans::T => (sa.ncols, sa.nrows),
        };
        let (kb, n) = match trans_b {
            Trans::N => sb.shape(),
            Trans::T => (sb.ncols, sb.nrows),
        };
        if ka != kb {
            return Err(FluxRustError::ShapeMismatch {
                expected: (m, ka),
                actual: (kb, n),
                operation: "add_dot (inner extents)".to_string(),
            });
        }
        check_same_shape((m, n), c.shape(), "add_dot")?;
        let entry = ctx.device_entry();
        ctx.enqueue(move || {
            let mut handle = entry.blas.lock().expect("blas handle poisoned");
            blas::gemm(&mut handle, trans_a, trans_b, alpha, &sa, &sb, beta, &c);
        });
        Ok(())
    }

    /// `self = op(a) * op(b)`.
    pub fn assign_dot(
        &self,
        ctx: &Context,
        a: &Buffer,
        b: &Buffer,
        trans_a: Trans,
        trans_b: Trans,
    ) -> Result<(), FluxRustError> {
        self.add_dot(ctx, a, b, trans_a, trans_b, 1.0, 0.0)
    }

    fn unary_spans(
        &self,
        ctx: &Context,
        out: &Buffer,
        derivative: Option<&Buffer>,
        op: &str,
    ) -> Result<(Span, Span, Option<Span>), FluxRustError> {
        let src = self.span_as(DType::F32, ctx, op)?;
        let dst = out.span_as(DType::F32, ctx, op)?;
        check_same_shape(src.shape(), dst.shape(), op)?;
        let der = match derivative {
            None => None,
            Some(d) => {
                let der = d.span_as(DType::F32, ctx, op)?;
                check_same_shape(src.shape(), der.shape(), op)?;
                Some(der)
            }
        };
        Ok((src, dst, der))
    }

    /// `out = tanh(self)`, optionally also writing the derivative.
    pub fn tanh(
        &self,
        ctx: &Context,
        out: &Buffer,
        derivative: Option<&Buffer>,
    ) -> Result<(), FluxRustError> {
        let (src, dst, der) = self.unary_spans(ctx, out, derivative, "tanh")?;
        ctx.enqueue(move || match der {
            None => nonlin::tanh(&src, &dst),
            Some(der) => nonlin::tanh_der(&src, &dst, &der),
        });
        Ok(())
    }

    /// `out = sigmoid(self)`, optionally also writing the derivative.
    pub fn sigmoid(
        &self,
        ctx: &Context,
        out: &Buffer,
        derivative: Option<&Buffer>,
    ) -> Result<(), FluxRustError> {
        let (src, dst, der) = self.unary_spans(ctx, out, derivative, "sigmoid")?;
        ctx.enqueue(move || match der {
            None => nonlin::sigmoid(&src, &dst),
            Some(der) => nonlin::sigmoid_der(&src, &dst, &der),
        });
        Ok(())
    }

    /// `out = relu(self)`, optionally also writing the derivative.
    pub fn relu(
        &self,
        ctx: &Context,
        out: &Buffer,
        derivative: Option<&Buffer>,
    ) -> Result<(), FluxRustError> {
        let (src, dst, der) = self.unary_spans(ctx, out, derivative, "relu")?;
        ctx.enqueue(move || match der {
            None => nonlin::relu(&src, &dst),
            Some(der) => nonlin::relu_der(&src, &dst, &der),
        });
        Ok(())
    }

    /// `out = softmax(self)`, row-wise.
    pub fn softmax(&self, ctx: &Context, out: &Buffer) -> Result<(), FluxRustError> {
        let (src, dst, _) = self.unary_spans(ctx, out, None, "softmax")?;
        let entry = ctx.device_entry();
        ctx.enqueue(move || {
            let mut handle = entry.nn.lock().expect("nn handle poisoned");
            nonlin::softmax(&mut handle, &src, &dst);
        });
        Ok(())
    }

    /// `out = self` with each element zeroed with probability `prob`,
    /// drawn from the device generator.
    pub fn dropout(&self, ctx: &Context, prob: f32, out: &Buffer) -> Result<(), FluxRustError> {
        if !(0.0..=1.0).contains(&prob) {
            return Err(FluxRustError::Configuration {
                message: format!("dropout probability {} outside [0, 1]", prob),
            });
        }
        let (src, dst, _) = self.unary_spans(ctx, out, None, "dropout")?;
        let entry = ctx.device_entry();
        ctx.enqueue(move || {
            let mut handle = entry.nn.lock().expect("nn handle poisoned");
            kernels::dropout(&mut handle, prob, &src, &dst);
        });
        Ok(())
    }

    /// `out = self * (mask != 0)`.
    pub fn mask_zeros(
        &self,
        ctx: &Context,
        mask: &Buffer,
        out: &Buffer,
    ) -> Result<(), FluxRustError> {
        let (src, dst, _) = self.unary_spans(ctx, out, None, "mask_zeros")?;
        let m = mask.span_as(DType::F32, ctx, "mask_zeros")?;
        check_same_shape(src.shape(), m.shape(), "mask_zeros")?;
        ctx.enqueue(move || kernels::mask_zeros(&src, &m, &dst));
        Ok(())
    }

    /// The active-step mask for a batch of variable-length rows:
    /// `self[i, j] = (j < lengths[i]) as f32`.
    pub fn sequence_mask(&self, ctx: &Context, lengths: &Buffer) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "sequence_mask")?;
        let lens = lengths.span_as(DType::I32, ctx, "sequence_mask")?;
        check_same_shape((dst.nrows, 1), lens.shape(), "sequence_mask")?;
        ctx.enqueue(move || kernels::sequence_mask(&lens, &dst));
        Ok(())
    }

    /// Fused gradient of softmax followed by mean cross-entropy, for
    /// integer class labels: `self += (probs - onehot(labels)) / batch`.
    pub fn add_softmax_ce_derivative(
        &self,
        ctx: &Context,
        probs: &Buffer,
        labels: &Buffer,
    ) -> Result<(), FluxRustError> {
        let dst = self.span_as(DType::F32, ctx, "add_softmax_ce_derivative")?;
        let p = probs.span_as(DType::F32, ctx, "add_softmax_ce_derivative")?;
        let l = labels.span_as(DType::I32, ctx, "add_softmax_ce_derivative")?;
        check_same_shape(dst.shape(), p.shape(), "add_softmax_ce_derivative")?;
        check_same_shape((dst.nrows, 1), l.shape(), "add_softmax_ce_derivative")?;
        ctx.enqueue(move || kernels::add_softmax_ce_derivative(&p, &l, &dst));
        Ok(())
    }
}
