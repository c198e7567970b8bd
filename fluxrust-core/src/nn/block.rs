use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::FluxRustError;

/// One learnable parameter as an optimizer sees it: the buffer to update,
/// the accumulated gradient, the context the gradient is produced on, and
/// the context the parameter is read on during the forward pass (so an
/// update step can `block` it until the new values are in place).
#[derive(Debug, Clone)]
pub struct ParamUpdate {
    pub param: Buffer,
    pub grad: Buffer,
    pub grad_context: Context,
    pub fprop_context: Context,
}

/// The contract every graph node implements.
///
/// A block wires its inputs at construction time by registering usage with
/// each input [`crate::connector::Connector`], obtaining a read handle
/// (plus a gradient sink when the edge is differentiable), and publishes its
/// outputs through connectors of its own. The external driver calls
/// `fprop` in graph order and, for training, `bprop` in reverse graph
/// order; neither call blocks, both only enqueue work.
pub trait Block {
    /// Pull inputs, compute, publish outputs.
    fn fprop(&mut self) -> Result<(), FluxRustError>;

    /// Pull accumulated output gradients, compute input gradients, push
    /// them upstream. Nodes without a backward path keep the default.
    fn bprop(&mut self) -> Result<(), FluxRustError> {
        Ok(())
    }

    /// The parameters this block owns, for the optimizer step.
    fn params(&self) -> Vec<ParamUpdate> {
        Vec::new()
    }
}
