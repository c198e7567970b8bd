use std::sync::{Arc, Mutex};

use log::warn;

use crate::buffer::Buffer;
use crate::connector::{Connector, GradSink};
use crate::context::Context;
use crate::device::Device;
use crate::error::FluxRustError;
use crate::nn::Block;
use crate::types::DType;

/// Softmax nonlinearity with mean cross-entropy loss.
///
/// A sink node: it publishes no connector. Labels may be integer class
/// indices (one column) or a one-hot float matrix; an optional mask zeroes
/// the gradient and the loss terms of padded rows.
///
/// The loss value itself is host-side work: `calculate_loss` enqueues the
/// read-back ordering on an evaluation context and defers the arithmetic to
/// that context's completion callbacks, so the training loop only pays for
/// it where it synchronizes anyway.
pub struct SoftmaxCeBlock {
    context: Context,
    x: Buffer,
    x_grad: Option<GradSink>,
    labels: Buffer,
    mask: Option<Buffer>,
    probs: Buffer,
    loss: Arc<Mutex<Option<f32>>>,
}

impl SoftmaxCeBlock {
    pub fn new(
        x: &Connector,
        labels: &Connector,
        mask: Option<&Connector>,
        device: Device,
    ) -> Result<Self, FluxRustError> {
        let context = Context::new(device)?;
        let (x_buf, x_grad) = if x.requires_grad() {
            let (buf, sink) = x.register_usage_with_grad(&context, &context)?;
            (buf, Some(sink))
        } else {
            (x.register_usage(&context)?, None)
        };
        let labels_buf = labels.register_usage(&context)?;
        let mask_buf = match mask {
            Some(mask) => Some(mask.register_usage(&context)?),
            None => None,
        };
        let probs = x_buf.empty_like()?;
        Ok(SoftmaxCeBlock {
            context,
            x: x_buf,
            x_grad,
            labels: labels_buf,
            mask: mask_buf,
            probs,
            loss: Arc::new(Mutex::new(None)),
        })
    }

    pub fn probs(&self) -> &Buffer {
        &self.probs
    }

    /// The most recent loss computed by [`SoftmaxCeBlock::calculate_loss`],
    /// available after the evaluation context synchronized.
    pub fn loss(&self) -> Option<f32> {
        *self.loss.lock().expect("loss cell poisoned")
    }

    /// Orders `eval` after this block's forward work and registers the
    /// cross-entropy arithmetic as a completion callback on `eval`; the
    /// value lands in [`SoftmaxCeBlock::loss`] once `eval.synchronize()`
    /// drains.
    pub fn calculate_loss(&self, eval: &Context) {
        eval.wait([&self.context]);
        let probs = self.probs.clone();
        let labels = self.labels.clone();
        let mask = self.mask.clone();
        let loss = Arc::clone(&self.loss);
        eval.add_callback(move || match ce_loss(&probs, &labels, mask.as_ref()) {
            Ok(value) => *loss.lock().expect("loss cell poisoned") = Some(value),
            Err(e) => warn!("cross-entropy loss read-back failed: {}", e),
        });
    }
}

fn ce_loss(
    probs: &Buffer,
    labels: &Buffer,
    mask: Option<&Buffer>,
) -> Result<f32, FluxRustError> {
    let p = probs.to_host::<f32>()?;
    let mask = match mask {
        Some(m) => Some(m.to_host::<f32>()?),
        None => None,
    };
    let mut total = 0.0f64;
    let nrows = p.nrows();
    match labels.dtype() {
        DType::I32 => {
            let l = labels.to_host::<i32>()?;
            for i in 0..nrows {
                let mut log = (p.get(i, l.get(i, 0) as usize) + 1e-20).ln();
                if let Some(m) = &mask {
                    log *= m.get(i, 0);
                }
                total += f64::from(log);
            }
        }
        DType::F32 => {
            let l = labels.to_host::<f32>()?;
            for i in 0..nrows {
                let mut inner = 0.0f32;
                for j in 0..p.ncols() {
                    inner += l.get(i, j) * p.get(i, j);
                }
                let mut log = (inner + 1e-20).ln();
                if let Some(m) = &mask {
                    log *= m.get(i, 0);
                }
                total += f64::from(log);
            }
        }
    }
    Ok(-(total / nrows as f64) as f32)
}

impl Block for SoftmaxCeBlock {
    fn fprop(&mut self) -> Result<(), FluxRustError> {
        self.probs.set_extents(self.x.nrows(), self.x.ncols())?;
        self.x.softmax(&self.context, &self.probs)
    }

    fn bprop(&mut self) -> Result<(), FluxRustError> {
        if let Some(sink) = &self.x_grad {
            let dx = sink.buffer();
            match self.labels.dtype() {
                DType::I32 => {
                    dx.fill(&self.context, 0.0f32)?;
                    dx.add_softmax_ce_derivative(&self.context, &self.probs, &self.labels)?;
                }
                DType::F32 => {
                    // dx = (probs - labels) / batch
                    let scale = 1.0 / self.probs.nrows() as f32;
                    dx.assign_scaled_subtraction(&self.context, scale, &self.probs, &self.labels)?;
                }
            }
            if let Some(mask) = &self.mask {
                dx.hprod(&self.context, mask)?;
            }
            sink.commit()?;
        }
        Ok(())
    }
}
