/// Source of the learning-rate value an update step reads each call.
pub trait LearningRatePolicy: Send {
    fn value(&self) -> f32;
}

/// Constant learning rate.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate {
    rate: f32,
}

impl FixedRate {
    pub fn new(rate: f32) -> Self {
        FixedRate { rate }
    }
}

impl LearningRatePolicy for FixedRate {
    fn value(&self) -> f32 {
        self.rate
    }
}
