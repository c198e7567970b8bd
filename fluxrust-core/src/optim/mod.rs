// Parameter update steps driven by the node contract's param records.

pub mod lr_policy;
pub mod sgd_step;

pub use lr_policy::{FixedRate, LearningRatePolicy};
pub use sgd_step::SgdStep;
