use crate::buffer::Buffer;
use crate::connector::{Connector, GradSink};
use crate::context::Context;
use crate::device::Device;
use crate::error::FluxRustError;
use crate::host::HostMatrix;
use crate::nn::{Block, ParamUpdate};
use crate::types::{DType, Trans};

/// Dense linear node: `y = x · W`.
///
/// Owns the weight matrix and its gradient. The batch extent follows the
/// input from step to step; the output connector is always differentiable
/// because the weight gradient needs the output gradient even when the
/// input edge is not.
pub struct DotBlock {
    context: Context,
    weights: Buffer,
    weight_grad: Buffer,
    x: Buffer,
    x_grad: Option<GradSink>,
    output: Connector,
}

impl DotBlock {
    pub fn new(
        weight_init: &HostMatrix<f32>,
        x: &Connector,
        device: Device,
    ) -> Result<Self, FluxRustError> {
        let context = Context::new(device)?;
        let weights = Buffer::from_host(device, weight_init)?;
        let weight_grad = weights.empty_like()?;
        let (x_buf, x_grad) = if x.requires_grad() {
            let (buf, sink) = x.register_usage_with_grad(&context, &context)?;
            (buf, Some(sink))
        } else {
            (x.register_usage(&context)?, None)
        };
        let value = Buffer::empty_on(device, x_buf.nrows(), weights.ncols(), DType::F32)?;
        let output = Connector::with_grad(value, context.clone(), context.clone())?;
        Ok(DotBlock {
            context,
            weights,
            weight_grad,
            x: x_buf,
            x_grad,
            output,
        })
    }

    pub fn output(&self) -> &Connector {
        &self.output
    }

    pub fn weights(&self) -> &Buffer {
        &self.weights
    }
}

impl Block for DotBlock {
    fn fprop(&mut self) -> Result<(), FluxRustError> {
        let value = self.output.value();
        value.set_nrows(self.x.nrows())?;
        value.assign_dot(&self.context, &self.x, &self.weights, Trans::N, Trans::N)?;
        self.output.fprop()
    }

    fn bprop(&mut self) -> Result<(), FluxRustError> {
        let output_grad = self.output.bprop()?;
        // dW = x^T · dy; one output edge, so assign rather than accumulate.
        self.weight_grad
            .assign_dot(&self.context, &self.x, &output_grad, Trans::T, Trans::N)?;
        if let Some(sink) = &self.x_grad {
            sink.buffer()
                .assign_dot(&self.context, &output_grad, &self.weights, Trans::N, Trans::T)?;
            sink.commit()?;
        }
        Ok(())
    }

    fn params(&self) -> Vec<ParamUpdate> {
        vec![ParamUpdate {
            param: self.weights.clone(),
            grad: self.weight_grad.clone(),
            grad_context: self.context.clone(),
            fprop_context: self.context.clone(),
        }]
    }
}
