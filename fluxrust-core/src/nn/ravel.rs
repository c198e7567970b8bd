use crate::buffer::Buffer;
use crate::connector::{Connector, GradSink};
use crate::context::Context;
use crate::device::Device;
use crate::error::FluxRustError;
use crate::nn::Block;

/// Flattens its input to a single column and republishes it.
///
/// Pure bookkeeping: the output is a no-copy view of the input handle, so
/// forward work is just the publish, and backward work is one flat copy of
/// the output gradient back into the input's shape.
pub struct Ravel {
    context: Context,
    input: Buffer,
    input_grad: Option<GradSink>,
    output: Connector,
}

impl Ravel {
    pub fn new(input: &Connector, device: Device) -> Result<Self, FluxRustError> {
        let context = Context::new(device)?;
        let (input_buf, input_grad) = if input.requires_grad() {
            let (buf, sink) = input.register_usage_with_grad(&context, &context)?;
            (buf, Some(sink))
        } else {
            (input.register_usage(&context)?, None)
        };
        let raveled = input_buf.ravel()?;
        let output = if input_grad.is_some() {
            Connector::with_grad(raveled, context.clone(), context.clone())?
        } else {
            Connector::new(raveled, context.clone())
        };
        Ok(Ravel {
            context,
            input: input_buf,
            input_grad,
            output,
        })
    }

    pub fn output(&self) -> &Connector {
        &self.output
    }
}

impl Block for Ravel {
    fn fprop(&mut self) -> Result<(), FluxRustError> {
        self.output.set_nrows(self.input.nelems())?;
        self.output.fprop()
    }

    fn bprop(&mut self) -> Result<(), FluxRustError> {
        if let Some(sink) = &self.input_grad {
            let grad = self.output.bprop()?;
            // Same elements, input-shaped again.
            grad.copy_to(&self.context, &sink.buffer())?;
            sink.commit()?;
        }
        Ok(())
    }
}
