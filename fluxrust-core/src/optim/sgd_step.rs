use crate::context::Context;
use crate::error::FluxRustError;
use crate::nn::ParamUpdate;
use crate::optim::LearningRatePolicy;

/// Plain SGD update: `param += -lr * grad`, one update context per
/// parameter so independent parameters update concurrently.
///
/// Each update context waits on the context that produced the gradient,
/// applies the step, then blocks the parameter's forward context: the next
/// `fprop` touching the parameter cannot start until the new values are in
/// place. Parameters and their gradients are expected to be colocated on
/// one device (the blocks in this crate guarantee it).
pub struct SgdStep {
    params: Vec<ParamUpdate>,
    contexts: Vec<Context>,
    policy: Box<dyn LearningRatePolicy>,
}

impl SgdStep {
    pub fn new(
        params: Vec<ParamUpdate>,
        policy: impl LearningRatePolicy + 'static,
    ) -> Result<Self, FluxRustError> {
        let contexts = params
            .iter()
            .map(|p| Context::new(p.param.device()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SgdStep {
            params,
            contexts,
            policy: Box::new(policy),
        })
    }

    /// Applies one update to every parameter. Asynchronous like everything
    /// else: the work is enqueued, ordered, and the call returns.
    pub fn notify(&self) -> Result<(), FluxRustError> {
        let rate = -self.policy.value();
        for (param, ctx) in self.params.iter().zip(&self.contexts) {
            ctx.wait([&param.grad_context]);
            param.param.add_scaled(ctx, rate, &param.grad)?;
            ctx.block([&param.fprop_context]);
        }
        Ok(())
    }
}
